//! Error types for the bluesec library
//!
//! This module defines the errors raised by the collaborators below the
//! Security Manager: the fixed-channel transport and the link layer.

use thiserror::Error;

/// Errors reported by the SMP transport or the link-layer controller interface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection handle 0x{0:04x} is not connected")]
    NotConnected(u16),

    #[error("Failed to send SMP PDU: {0}")]
    SendFailed(String),

    #[error("Controller rejected command with status 0x{0:02x}")]
    CommandRejected(u8),

    #[error("Unsupported operation")]
    Unsupported,
}
