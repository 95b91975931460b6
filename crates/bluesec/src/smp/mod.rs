//! Security Manager Protocol (SMP) implementation
//!
//! This module implements the LE Security Manager, which is responsible for:
//! - Pairing devices with LE Legacy Pairing or LE Secure Connections
//! - Generating and distributing encryption, identity and signing keys
//! - Keeping a persistent database of bonded peers
//! - Encrypting links and answering the controller's LTK requests
//!
//! [`SmpManager`] is the entry point. It talks to the outside world through
//! [`SmpTransport`], [`LinkLayer`], [`CryptoProvider`] and [`TagValueStore`],
//! and reports to the application through [`SmpEventHandler`].

mod constants;
pub mod crypto;
mod encryption;
mod keys;
mod manager;
mod pairing;
mod pdu;
mod store;
mod types;


// Re-export public API
pub use self::constants::SMP_CID;
pub use self::crypto::{CryptoProvider, CryptoRequest, CryptoResponse, CryptoToken, SoftwareCrypto};
pub use self::encryption::{EncryptionChange, EncryptionCoordinator, EncryptionPurpose, LinkLayer, LtkAnswer};
pub use self::keys::{BondingEntry, DistributedKeys, LongTermKey, MemoryTagStore, SigningKey, TagValueStore};
pub use self::manager::{SmpEventHandler, SmpManager, SmpTransport};
pub use self::pairing::{
    select_method, AssociationModel, PairingAction, PairingContext, PairingEnv, PairingResult,
    PairingState, UserWait,
};
pub use self::pdu::{DecodeError, InvalidField, PairingParameters, PduAssembler, SmpPdu};
pub use self::store::{BondingStore, StoreError};
pub use self::types::*;
