//! bluesec - Bluetooth Low Energy Security Manager
//!
//! This library implements the LE Security Manager of a Bluetooth host: the
//! SMP PDU codec, the pairing state machine for Legacy Pairing and Secure
//! Connections, the bonding database and the coordination of link encryption.
//! The L2CAP fixed channel, the controller and the persistence medium are
//! supplied by the caller through small traits.

pub mod error;
pub mod gap;
pub mod smp;

// Re-export common types for convenience
pub use error::TransportError;
pub use gap::{AddressType, BdAddr, LeAddress};
pub use smp::{
    AuthRequirements, BondingStore, IoCapability, KeyDistribution, LinkLayer, MemoryTagStore,
    PairingEvent, SecurityConfig, SecurityLevel, SmpEvent, SmpEventHandler, SmpManager,
    SmpTransport, SoftwareCrypto,
};
