//! Constants for the Security Manager Protocol

// SMP command codes
pub const SMP_PAIRING_REQUEST: u8 = 0x01;
pub const SMP_PAIRING_RESPONSE: u8 = 0x02;
pub const SMP_PAIRING_CONFIRM: u8 = 0x03;
pub const SMP_PAIRING_RANDOM: u8 = 0x04;
pub const SMP_PAIRING_FAILED: u8 = 0x05;
pub const SMP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const SMP_MASTER_IDENTIFICATION: u8 = 0x07;
pub const SMP_IDENTITY_INFORMATION: u8 = 0x08;
pub const SMP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SMP_SIGNING_INFORMATION: u8 = 0x0A;
pub const SMP_SECURITY_REQUEST: u8 = 0x0B;
pub const SMP_PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const SMP_PAIRING_DHK_CHECK: u8 = 0x0D;
pub const SMP_PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;

// Complete PDU sizes, opcode included
pub const SMP_PAIRING_REQUEST_SIZE: usize = 7;
pub const SMP_KEY_PDU_SIZE: usize = 17;
pub const SMP_PAIRING_FAILED_SIZE: usize = 2;
pub const SMP_MASTER_IDENTIFICATION_SIZE: usize = 11;
pub const SMP_IDENTITY_ADDRESS_INFORMATION_SIZE: usize = 8;
pub const SMP_SECURITY_REQUEST_SIZE: usize = 2;
pub const SMP_PAIRING_PUBLIC_KEY_SIZE: usize = 65;
pub const SMP_KEYPRESS_NOTIFICATION_SIZE: usize = 2;

/// `SignCounter || MAC` appended to signed data
pub const SMP_SIGNATURE_SIZE: usize = 12;

// SMP fixed channel ID
pub const SMP_CID: u16 = 0x0006;

// IO Capability values
pub const SMP_IO_CAPABILITY_DISPLAY_ONLY: u8 = 0x00;
pub const SMP_IO_CAPABILITY_DISPLAY_YES_NO: u8 = 0x01;
pub const SMP_IO_CAPABILITY_KEYBOARD_ONLY: u8 = 0x02;
pub const SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const SMP_IO_CAPABILITY_KEYBOARD_DISPLAY: u8 = 0x04;

// OOB data flag values
pub const SMP_OOB_NOT_PRESENT: u8 = 0x00;
pub const SMP_OOB_PRESENT: u8 = 0x01;

// Authentication Requirements bit masks
pub const SMP_AUTH_REQ_BONDING: u8 = 0x01;
pub const SMP_AUTH_REQ_BONDING_FLAGS: u8 = 0x03;
pub const SMP_AUTH_REQ_MITM: u8 = 0x04;
pub const SMP_AUTH_REQ_SC: u8 = 0x08;
pub const SMP_AUTH_REQ_KEYPRESS: u8 = 0x10;
pub const SMP_AUTH_REQ_CT2: u8 = 0x20;

// Pairing Failed reason codes
pub const SMP_REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const SMP_REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const SMP_REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const SMP_REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const SMP_REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const SMP_REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const SMP_REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SMP_REASON_UNSPECIFIED_REASON: u8 = 0x08;
pub const SMP_REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const SMP_REASON_INVALID_PARAMETERS: u8 = 0x0A;
pub const SMP_REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const SMP_REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;
pub const SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS: u8 = 0x0D;
pub const SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED: u8 = 0x0E;

// SMP key distribution bit masks
pub const SMP_KEY_DIST_ENC_KEY: u8 = 0x01;
pub const SMP_KEY_DIST_ID_KEY: u8 = 0x02;
pub const SMP_KEY_DIST_SIGN_KEY: u8 = 0x04;
pub const SMP_KEY_DIST_LINK_KEY: u8 = 0x08;

// SMP encryption key size limits
pub const SMP_MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
pub const SMP_MAX_ENCRYPTION_KEY_SIZE: u8 = 16;

// Keypress notification types
pub const SMP_KEYPRESS_ENTRY_STARTED: u8 = 0x00;
pub const SMP_KEYPRESS_DIGIT_ENTERED: u8 = 0x01;
pub const SMP_KEYPRESS_DIGIT_ERASED: u8 = 0x02;
pub const SMP_KEYPRESS_CLEARED: u8 = 0x03;
pub const SMP_KEYPRESS_ENTRY_COMPLETED: u8 = 0x04;

// SMP timeout (in milliseconds)
pub const SMP_TIMEOUT_GENERAL: u64 = 30000;

// Passkeys are six decimal digits
pub const SMP_PASSKEY_MAX: u32 = 999_999;
pub const SMP_PASSKEY_ROUNDS: u8 = 20;

// Salt for the f5 key derivation function
pub const SMP_F5_SALT: u128 = 0x6C88_8391_AAF5_A538_6037_0BDB_5A60_83BE;

// HCI status reported when the peer has no key for re-encryption
pub const HCI_STATUS_PIN_OR_KEY_MISSING: u8 = 0x06;

// Bonding store persistence: tag = 'B' 'T' 'D' <slot>
pub const SMP_BOND_TAG_PREFIX: u32 = u32::from_be_bytes([b'B', b'T', b'D', 0]);
pub const SMP_BOND_MAX_SLOTS: usize = 256;
pub const SMP_BOND_RECORD_SIZE: usize = 91;

// Bonding record flags
pub const SMP_BOND_FLAG_AUTHENTICATED: u8 = 0x01;
pub const SMP_BOND_FLAG_AUTHORIZED: u8 = 0x02;
pub const SMP_BOND_FLAG_SECURE_CONNECTIONS: u8 = 0x04;
pub const SMP_BOND_FLAG_IRK: u8 = 0x08;
pub const SMP_BOND_FLAG_LTK: u8 = 0x10;
pub const SMP_BOND_FLAG_LOCAL_CSRK: u8 = 0x20;
pub const SMP_BOND_FLAG_REMOTE_CSRK: u8 = 0x40;
