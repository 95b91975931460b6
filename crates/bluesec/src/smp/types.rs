//! Type definitions for the Security Manager Protocol
use super::constants::*;
use super::pdu::{DecodeError, InvalidField};
use super::store::StoreError;
use crate::error::TransportError;
use crate::gap::LeAddress;
use bitflags::bitflags;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HCI connection handle identifying an LE link
pub type ConnectionHandle = u16;

/// Index of an entry in the bonding store
pub type SlotIndex = usize;

/// SMP Error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Connection 0x{0:04x} not found")]
    ConnectionNotFound(ConnectionHandle),

    #[error("Pairing already in progress on connection 0x{0:04x}")]
    PairingInProgress(ConnectionHandle),

    #[error("No pairing in progress on connection 0x{0:04x}")]
    NoPairingInProgress(ConnectionHandle),

    #[error("Operation requires the {0} role")]
    WrongRole(PairingRole),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("No signing key for connection 0x{0:04x}")]
    NoSigningKey(ConnectionHandle),

    #[error("Signature check failed on connection 0x{0:04x}")]
    InvalidSignature(ConnectionHandle),

    #[error("Malformed PDU: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid PDU field: {0}")]
    InvalidField(#[from] InvalidField),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Bonding store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    pub const ALL: [IoCapability; 5] = [
        IoCapability::DisplayOnly,
        IoCapability::DisplayYesNo,
        IoCapability::KeyboardOnly,
        IoCapability::NoInputNoOutput,
        IoCapability::KeyboardDisplay,
    ];

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Pairing methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    /// Just Works method - no user interaction
    JustWorks,
    /// Passkey Entry - one device enters a passkey
    PasskeyEntry,
    /// Numeric Comparison - user confirms matching numbers
    NumericComparison,
    /// Out of Band data
    OutOfBand,
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::JustWorks => write!(f, "Just Works"),
            PairingMethod::PasskeyEntry => write!(f, "Passkey Entry"),
            PairingMethod::NumericComparison => write!(f, "Numeric Comparison"),
            PairingMethod::OutOfBand => write!(f, "Out of Band"),
        }
    }
}

/// Authentication requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequirements {
    /// Whether bonding is required
    pub bonding: bool,
    /// Whether MITM protection is required
    pub mitm: bool,
    /// Whether Secure Connections is required
    pub secure_connections: bool,
    /// Whether keypress notifications are required
    pub keypress_notifications: bool,
    /// Whether CT2 feature is supported
    pub ct2: bool,
}

impl AuthRequirements {
    /// Create new authentication requirements
    pub fn new(bonding: bool, mitm: bool, secure_connections: bool) -> Self {
        Self {
            bonding,
            mitm,
            secure_connections,
            keypress_notifications: false,
            ct2: false,
        }
    }

    /// Bonding, MITM protection and Secure Connections
    pub fn secure() -> Self {
        Self::new(true, true, true)
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        let mut value = 0;

        if self.bonding {
            value |= SMP_AUTH_REQ_BONDING;
        }

        if self.mitm {
            value |= SMP_AUTH_REQ_MITM;
        }

        if self.secure_connections {
            value |= SMP_AUTH_REQ_SC;
        }

        if self.keypress_notifications {
            value |= SMP_AUTH_REQ_KEYPRESS;
        }

        if self.ct2 {
            value |= SMP_AUTH_REQ_CT2;
        }

        value
    }

    /// Convert from u8 value from protocol. Reserved bits are ignored.
    pub fn from_u8(value: u8) -> Self {
        Self {
            bonding: (value & SMP_AUTH_REQ_BONDING) != 0,
            mitm: (value & SMP_AUTH_REQ_MITM) != 0,
            secure_connections: (value & SMP_AUTH_REQ_SC) != 0,
            keypress_notifications: (value & SMP_AUTH_REQ_KEYPRESS) != 0,
            ct2: (value & SMP_AUTH_REQ_CT2) != 0,
        }
    }
}

impl Default for AuthRequirements {
    /// Bonding enabled, everything else disabled
    fn default() -> Self {
        Self::new(true, false, false)
    }
}

bitflags! {
    /// Key distribution field of the Pairing Request/Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDistribution: u8 {
        /// LTK, EDIV and Rand (Legacy only)
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        /// IRK and identity address
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        /// CSRK
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        /// BR/EDR link key derivation
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

bitflags! {
    /// Association methods the application is willing to accept
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcceptedMethods: u8 {
        const JUST_WORKS = 0x01;
        const PASSKEY_ENTRY = 0x02;
        const NUMERIC_COMPARISON = 0x04;
        const OUT_OF_BAND = 0x08;
    }
}

impl AcceptedMethods {
    pub fn accepts(&self, method: PairingMethod) -> bool {
        let flag = match method {
            PairingMethod::JustWorks => AcceptedMethods::JUST_WORKS,
            PairingMethod::PasskeyEntry => AcceptedMethods::PASSKEY_ENTRY,
            PairingMethod::NumericComparison => AcceptedMethods::NUMERIC_COMPARISON,
            PairingMethod::OutOfBand => AcceptedMethods::OUT_OF_BAND,
        };
        self.contains(flag)
    }
}

/// Pairing Failed reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
    /// A reason code this implementation does not know, kept verbatim
    Reserved(u8),
}

impl FailureReason {
    pub fn to_u8(&self) -> u8 {
        match self {
            FailureReason::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            FailureReason::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            FailureReason::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            FailureReason::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            FailureReason::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            FailureReason::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            FailureReason::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            FailureReason::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            FailureReason::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            FailureReason::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            FailureReason::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            FailureReason::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            FailureReason::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            FailureReason::CrossTransportKeyNotAllowed => {
                SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED
            }
            FailureReason::Reserved(value) => *value,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => FailureReason::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => FailureReason::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => FailureReason::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => FailureReason::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => FailureReason::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => FailureReason::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => FailureReason::CommandNotSupported,
            SMP_REASON_UNSPECIFIED_REASON => FailureReason::UnspecifiedReason,
            SMP_REASON_REPEATED_ATTEMPTS => FailureReason::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => FailureReason::InvalidParameters,
            SMP_REASON_DHKEY_CHECK_FAILED => FailureReason::DhKeyCheckFailed,
            SMP_REASON_NUMERIC_COMPARISON_FAILED => FailureReason::NumericComparisonFailed,
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => FailureReason::BrEdrPairingInProgress,
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => {
                FailureReason::CrossTransportKeyNotAllowed
            }
            other => FailureReason::Reserved(other),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PasskeyEntryFailed => write!(f, "passkey entry failed"),
            FailureReason::OobNotAvailable => write!(f, "OOB data not available"),
            FailureReason::AuthenticationRequirements => {
                write!(f, "authentication requirements not met")
            }
            FailureReason::ConfirmValueFailed => write!(f, "confirm value failed"),
            FailureReason::PairingNotSupported => write!(f, "pairing not supported"),
            FailureReason::EncryptionKeySize => write!(f, "encryption key size"),
            FailureReason::CommandNotSupported => write!(f, "command not supported"),
            FailureReason::UnspecifiedReason => write!(f, "unspecified reason"),
            FailureReason::RepeatedAttempts => write!(f, "repeated attempts"),
            FailureReason::InvalidParameters => write!(f, "invalid parameters"),
            FailureReason::DhKeyCheckFailed => write!(f, "DHKey check failed"),
            FailureReason::NumericComparisonFailed => write!(f, "numeric comparison failed"),
            FailureReason::BrEdrPairingInProgress => write!(f, "BR/EDR pairing in progress"),
            FailureReason::CrossTransportKeyNotAllowed => {
                write!(f, "cross-transport key derivation not allowed")
            }
            FailureReason::Reserved(value) => write!(f, "reserved reason 0x{:02x}", value),
        }
    }
}

/// Why a pairing attempt ended without success
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingFailure {
    #[error("pairing aborted locally: {0}")]
    Local(FailureReason),

    #[error("peer reported pairing failure: {0}")]
    Remote(FailureReason),

    #[error("pairing timed out")]
    Timeout,

    #[error("link disconnected during pairing")]
    Disconnected,

    #[error("link encryption failed with status 0x{0:02x}")]
    Encryption(u8),

    #[error("keys agreed but bonding failed: {0}")]
    Bonding(StoreError),
}

impl PairingFailure {
    /// The protocol reason code, if the failure carried one
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            PairingFailure::Local(reason) | PairingFailure::Remote(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Pairing Role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingRole {
    /// Initiator of the pairing (Central)
    Initiator,
    /// Responder to pairing (Peripheral)
    Responder,
}

impl fmt::Display for PairingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingRole::Initiator => write!(f, "initiator"),
            PairingRole::Responder => write!(f, "responder"),
        }
    }
}

/// Security level for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    None = 0,
    /// Encryption without authentication (Just Works)
    EncryptionOnly = 1,
    /// Encryption with authentication (MITM protection)
    EncryptionWithAuthentication = 2,
    /// Authenticated Secure Connections
    SecureConnections = 3,
}

impl SecurityLevel {
    pub fn from_link(encrypted: bool, authenticated: bool, secure_connections: bool) -> Self {
        match (encrypted, authenticated, secure_connections) {
            (false, _, _) => SecurityLevel::None,
            (true, false, _) => SecurityLevel::EncryptionOnly,
            (true, true, false) => SecurityLevel::EncryptionWithAuthentication,
            (true, true, true) => SecurityLevel::SecureConnections,
        }
    }

    /// Check if this security level includes encryption
    pub fn is_encrypted(&self) -> bool {
        *self >= SecurityLevel::EncryptionOnly
    }

    /// Check if this security level includes authentication
    pub fn is_authenticated(&self) -> bool {
        *self >= SecurityLevel::EncryptionWithAuthentication
    }
}

/// Keypress notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypressNotificationType {
    /// Entry started
    EntryStarted,
    /// Digit entered
    DigitEntered,
    /// Digit erased
    DigitErased,
    /// Cleared
    Cleared,
    /// Entry completed
    EntryCompleted,
}

impl KeypressNotificationType {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            KeypressNotificationType::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            KeypressNotificationType::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            KeypressNotificationType::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            KeypressNotificationType::Cleared => SMP_KEYPRESS_CLEARED,
            KeypressNotificationType::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(KeypressNotificationType::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(KeypressNotificationType::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(KeypressNotificationType::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(KeypressNotificationType::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(KeypressNotificationType::EntryCompleted),
            _ => None,
        }
    }
}

/// Out of band data provided by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobData {
    /// Legacy pairing: the 128-bit Temporary Key exchanged out of band
    Legacy { tk: [u8; 16] },
    /// Secure Connections: the peer's random and confirm values, little-endian
    SecureConnections { random: [u8; 16], confirm: [u8; 16] },
}

/// Secure Connections OOB data generated by this device, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScOobData {
    pub confirm: [u8; 16],
    pub random: [u8; 16],
}

impl From<ScOobData> for OobData {
    fn from(data: ScOobData) -> Self {
        OobData::SecureConnections {
            random: data.random,
            confirm: data.confirm,
        }
    }
}

/// Local identity distributed during key distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Identity Resolving Key, little-endian
    pub irk: [u8; 16],
    /// Public or static random identity address
    pub address: LeAddress,
}

/// Capabilities and policy used by every new pairing attempt
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub io_capability: IoCapability,
    pub auth_req: AuthRequirements,
    pub oob_data: Option<OobData>,
    /// Passkey shown when this side displays, instead of a random one
    pub fixed_passkey: Option<u32>,
    pub identity: Option<LocalIdentity>,
    /// Signing key distributed when signing keys are requested
    pub csrk: Option<[u8; 16]>,
    pub min_key_size: u8,
    pub max_key_size: u8,
    pub accepted_methods: AcceptedMethods,
    /// Refuse Legacy pairing
    pub secure_connections_only: bool,
    /// Ask the application before completing Just Works pairing
    pub just_works_confirmation: bool,
    pub timeout: Duration,
}

impl SecurityConfig {
    /// Whether Legacy OOB or peer Secure Connections OOB data is configured
    pub fn has_oob_data(&self) -> bool {
        self.oob_data.is_some()
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            auth_req: AuthRequirements::default(),
            oob_data: None,
            fixed_passkey: None,
            identity: None,
            csrk: None,
            min_key_size: SMP_MIN_ENCRYPTION_KEY_SIZE,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            accepted_methods: AcceptedMethods::all(),
            secure_connections_only: false,
            just_works_confirmation: false,
            timeout: Duration::from_millis(SMP_TIMEOUT_GENERAL),
        }
    }
}

/// A request for user interaction on a pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequest {
    /// Confirm Just Works pairing
    JustWorksConfirm,
    /// Enter the passkey shown on the peer
    PasskeyInput,
    /// Show this passkey to the user
    PasskeyDisplay(u32),
    /// Ask the user whether this value matches the peer's
    NumericComparison(u32),
}

/// Result of a successful pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSummary {
    pub method: PairingMethod,
    pub secure_connections: bool,
    pub authenticated: bool,
    pub key_size: u8,
    pub security_level: SecurityLevel,
    /// Bonding store slot, when both sides requested bonding
    pub bonded_slot: Option<SlotIndex>,
}

/// Pairing progress and link security events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    Started {
        handle: ConnectionHandle,
        peer: LeAddress,
    },
    Complete {
        handle: ConnectionHandle,
        peer: LeAddress,
        result: Result<PairingSummary, PairingFailure>,
    },
    ReencryptionStarted {
        handle: ConnectionHandle,
        peer: LeAddress,
    },
    ReencryptionComplete {
        handle: ConnectionHandle,
        peer: LeAddress,
        result: Result<SecurityLevel, PairingFailure>,
    },
    Keypress {
        handle: ConnectionHandle,
        notification: KeypressNotificationType,
    },
    Authorization {
        handle: ConnectionHandle,
        granted: bool,
    },
}

/// Identity resolution and bonding database events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    /// The peer address matched a bonded identity
    Resolved {
        handle: ConnectionHandle,
        peer: LeAddress,
        identity: LeAddress,
        slot: SlotIndex,
    },
    /// No bond matched the peer address
    NotFound {
        handle: ConnectionHandle,
        peer: LeAddress,
    },
    /// Pairing stored a bond for this identity
    Created {
        handle: ConnectionHandle,
        identity: LeAddress,
        slot: SlotIndex,
    },
}

/// All events emitted by the Security Manager, as delivered to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    UserRequest {
        handle: ConnectionHandle,
        peer: LeAddress,
        request: UserRequest,
    },
    Pairing(PairingEvent),
    Identity(IdentityEvent),
}
