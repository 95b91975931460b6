//! Security Manager Protocol PDU codec
//!
//! Every SMP PDU is one opcode byte followed by a fixed-size payload. Field
//! values are kept exactly as received so that out-of-range values can be
//! rejected with the proper protocol reason instead of being clamped.

use super::constants::*;
use super::types::{
    AuthRequirements, FailureReason, IoCapability, KeyDistribution, KeypressNotificationType,
};
use crate::gap::constants::{PUBLIC_DEVICE_ADDRESS, RANDOM_DEVICE_ADDRESS};
use crate::gap::{AddressType, BdAddr, LeAddress};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Errors raised while decoding an SMP PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("PDU truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("PDU too long: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unknown SMP opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

/// An enumerated field outside its legal range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidField {
    #[error("invalid IO capability 0x{0:02x}")]
    IoCapability(u8),

    #[error("invalid bonding flags 0x{0:02x}")]
    BondingFlags(u8),

    #[error("invalid OOB data flag 0x{0:02x}")]
    OobDataFlag(u8),

    #[error("invalid maximum encryption key size {0}")]
    MaxKeySize(u8),

    #[error("invalid identity address type 0x{0:02x}")]
    AddressType(u8),

    #[error("invalid keypress notification type 0x{0:02x}")]
    KeypressType(u8),
}

/// Total size of a PDU with the given opcode, opcode byte included
pub fn pdu_size(opcode: u8) -> Option<usize> {
    let size = match opcode {
        SMP_PAIRING_REQUEST | SMP_PAIRING_RESPONSE => SMP_PAIRING_REQUEST_SIZE,
        SMP_PAIRING_CONFIRM
        | SMP_PAIRING_RANDOM
        | SMP_ENCRYPTION_INFORMATION
        | SMP_IDENTITY_INFORMATION
        | SMP_SIGNING_INFORMATION
        | SMP_PAIRING_DHK_CHECK => SMP_KEY_PDU_SIZE,
        SMP_PAIRING_FAILED => SMP_PAIRING_FAILED_SIZE,
        SMP_MASTER_IDENTIFICATION => SMP_MASTER_IDENTIFICATION_SIZE,
        SMP_IDENTITY_ADDRESS_INFORMATION => SMP_IDENTITY_ADDRESS_INFORMATION_SIZE,
        SMP_SECURITY_REQUEST => SMP_SECURITY_REQUEST_SIZE,
        SMP_PAIRING_PUBLIC_KEY => SMP_PAIRING_PUBLIC_KEY_SIZE,
        SMP_PAIRING_KEYPRESS_NOTIFICATION => SMP_KEYPRESS_NOTIFICATION_SIZE,
        _ => return None,
    };
    Some(size)
}

/// Payload of the Pairing Request and Pairing Response PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingParameters {
    pub io_capability: u8,
    pub oob_data_flag: u8,
    pub auth_req: u8,
    pub max_key_size: u8,
    pub initiator_key_distribution: u8,
    pub responder_key_distribution: u8,
}

impl PairingParameters {
    pub fn new(
        io_capability: IoCapability,
        oob: bool,
        auth_req: AuthRequirements,
        max_key_size: u8,
        initiator_keys: KeyDistribution,
        responder_keys: KeyDistribution,
    ) -> Self {
        Self {
            io_capability: io_capability.to_u8(),
            oob_data_flag: if oob { SMP_OOB_PRESENT } else { SMP_OOB_NOT_PRESENT },
            auth_req: auth_req.to_u8(),
            max_key_size,
            initiator_key_distribution: initiator_keys.bits(),
            responder_key_distribution: responder_keys.bits(),
        }
    }

    /// IO capability, or `None` for a reserved value
    pub fn io(&self) -> Option<IoCapability> {
        IoCapability::from_u8(self.io_capability)
    }

    pub fn oob_present(&self) -> bool {
        self.oob_data_flag == SMP_OOB_PRESENT
    }

    pub fn auth(&self) -> AuthRequirements {
        AuthRequirements::from_u8(self.auth_req)
    }

    pub fn initiator_keys(&self) -> KeyDistribution {
        KeyDistribution::from_bits_truncate(self.initiator_key_distribution)
    }

    pub fn responder_keys(&self) -> KeyDistribution {
        KeyDistribution::from_bits_truncate(self.responder_key_distribution)
    }

    /// The six payload bytes in wire order
    pub fn to_bytes(&self) -> [u8; 6] {
        [
            self.io_capability,
            self.oob_data_flag,
            self.auth_req,
            self.max_key_size,
            self.initiator_key_distribution,
            self.responder_key_distribution,
        ]
    }

    fn from_bytes(body: &[u8]) -> Self {
        Self {
            io_capability: body[0],
            oob_data_flag: body[1],
            auth_req: body[2],
            max_key_size: body[3],
            initiator_key_distribution: body[4],
            responder_key_distribution: body[5],
        }
    }

    fn validate(&self) -> Result<(), InvalidField> {
        if self.io_capability > SMP_IO_CAPABILITY_KEYBOARD_DISPLAY {
            return Err(InvalidField::IoCapability(self.io_capability));
        }
        if self.oob_data_flag > SMP_OOB_PRESENT {
            return Err(InvalidField::OobDataFlag(self.oob_data_flag));
        }
        let bonding_flags = self.auth_req & SMP_AUTH_REQ_BONDING_FLAGS;
        if bonding_flags > SMP_AUTH_REQ_BONDING {
            return Err(InvalidField::BondingFlags(bonding_flags));
        }
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&self.max_key_size)
        {
            return Err(InvalidField::MaxKeySize(self.max_key_size));
        }
        Ok(())
    }
}

/// A decoded SMP PDU. 128-bit values and public key coordinates are kept in
/// their little-endian wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingParameters),
    PairingResponse(PairingParameters),
    PairingConfirm([u8; 16]),
    PairingRandom([u8; 16]),
    PairingFailed(FailureReason),
    EncryptionInformation([u8; 16]),
    MasterIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation([u8; 16]),
    IdentityAddressInformation { address_type: u8, address: BdAddr },
    SigningInformation([u8; 16]),
    SecurityRequest { auth_req: u8 },
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck([u8; 16]),
    KeypressNotification(u8),
}

fn key_bytes(body: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&body[..16]);
    out
}

impl SmpPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => SMP_PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            SmpPdu::PairingConfirm(_) => SMP_PAIRING_CONFIRM,
            SmpPdu::PairingRandom(_) => SMP_PAIRING_RANDOM,
            SmpPdu::PairingFailed(_) => SMP_PAIRING_FAILED,
            SmpPdu::EncryptionInformation(_) => SMP_ENCRYPTION_INFORMATION,
            SmpPdu::MasterIdentification { .. } => SMP_MASTER_IDENTIFICATION,
            SmpPdu::IdentityInformation(_) => SMP_IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation { .. } => SMP_IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation(_) => SMP_SIGNING_INFORMATION,
            SmpPdu::SecurityRequest { .. } => SMP_SECURITY_REQUEST,
            SmpPdu::PairingPublicKey { .. } => SMP_PAIRING_PUBLIC_KEY,
            SmpPdu::PairingDhKeyCheck(_) => SMP_PAIRING_DHK_CHECK,
            SmpPdu::KeypressNotification(_) => SMP_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    /// Decode a complete PDU. The buffer must hold exactly one PDU.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (&opcode, body) = data.split_first().ok_or(DecodeError::Truncated {
            expected: 1,
            actual: 0,
        })?;
        let expected = pdu_size(opcode).ok_or(DecodeError::UnknownOpcode(opcode))?;

        if data.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                actual: data.len(),
            });
        }
        if data.len() > expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }

        let pdu = match opcode {
            SMP_PAIRING_REQUEST => SmpPdu::PairingRequest(PairingParameters::from_bytes(body)),
            SMP_PAIRING_RESPONSE => SmpPdu::PairingResponse(PairingParameters::from_bytes(body)),
            SMP_PAIRING_CONFIRM => SmpPdu::PairingConfirm(key_bytes(body)),
            SMP_PAIRING_RANDOM => SmpPdu::PairingRandom(key_bytes(body)),
            SMP_PAIRING_FAILED => SmpPdu::PairingFailed(FailureReason::from_u8(body[0])),
            SMP_ENCRYPTION_INFORMATION => SmpPdu::EncryptionInformation(key_bytes(body)),
            SMP_MASTER_IDENTIFICATION => {
                let mut rand = [0u8; 8];
                rand.copy_from_slice(&body[2..10]);
                SmpPdu::MasterIdentification {
                    ediv: LittleEndian::read_u16(&body[0..2]),
                    rand,
                }
            }
            SMP_IDENTITY_INFORMATION => SmpPdu::IdentityInformation(key_bytes(body)),
            SMP_IDENTITY_ADDRESS_INFORMATION => {
                let address = BdAddr::from_slice(&body[1..]).ok_or(DecodeError::Truncated {
                    expected,
                    actual: data.len(),
                })?;
                SmpPdu::IdentityAddressInformation {
                    address_type: body[0],
                    address,
                }
            }
            SMP_SIGNING_INFORMATION => SmpPdu::SigningInformation(key_bytes(body)),
            SMP_SECURITY_REQUEST => SmpPdu::SecurityRequest { auth_req: body[0] },
            SMP_PAIRING_PUBLIC_KEY => {
                let mut x = [0u8; 32];
                let mut y = [0u8; 32];
                x.copy_from_slice(&body[0..32]);
                y.copy_from_slice(&body[32..64]);
                SmpPdu::PairingPublicKey { x, y }
            }
            SMP_PAIRING_DHK_CHECK => SmpPdu::PairingDhKeyCheck(key_bytes(body)),
            SMP_PAIRING_KEYPRESS_NOTIFICATION => SmpPdu::KeypressNotification(body[0]),
            _ => return Err(DecodeError::UnknownOpcode(opcode)),
        };

        Ok(pdu)
    }

    /// Encode to the exact wire size for the opcode
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SMP_PAIRING_PUBLIC_KEY_SIZE);
        out.push(self.opcode());

        match self {
            SmpPdu::PairingRequest(params) | SmpPdu::PairingResponse(params) => {
                out.extend_from_slice(&params.to_bytes());
            }
            SmpPdu::PairingConfirm(value)
            | SmpPdu::PairingRandom(value)
            | SmpPdu::EncryptionInformation(value)
            | SmpPdu::IdentityInformation(value)
            | SmpPdu::SigningInformation(value)
            | SmpPdu::PairingDhKeyCheck(value) => out.extend_from_slice(value),
            SmpPdu::PairingFailed(reason) => out.push(reason.to_u8()),
            SmpPdu::MasterIdentification { ediv, rand } => {
                let mut ediv_bytes = [0u8; 2];
                LittleEndian::write_u16(&mut ediv_bytes, *ediv);
                out.extend_from_slice(&ediv_bytes);
                out.extend_from_slice(rand);
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                out.push(*address_type);
                out.extend_from_slice(address.as_slice());
            }
            SmpPdu::SecurityRequest { auth_req } => out.push(*auth_req),
            SmpPdu::PairingPublicKey { x, y } => {
                out.extend_from_slice(x);
                out.extend_from_slice(y);
            }
            SmpPdu::KeypressNotification(kind) => out.push(*kind),
        }

        out
    }

    /// Check enumerated fields against their legal ranges
    pub fn validate(&self) -> Result<(), InvalidField> {
        match self {
            SmpPdu::PairingRequest(params) | SmpPdu::PairingResponse(params) => {
                params.validate()
            }
            SmpPdu::IdentityAddressInformation { address_type, .. } => {
                if *address_type > RANDOM_DEVICE_ADDRESS {
                    Err(InvalidField::AddressType(*address_type))
                } else {
                    Ok(())
                }
            }
            SmpPdu::KeypressNotification(kind) => KeypressNotificationType::from_u8(*kind)
                .map(|_| ())
                .ok_or(InvalidField::KeypressType(*kind)),
            _ => Ok(()),
        }
    }

    /// Identity address carried by an Identity Address Information PDU
    pub fn identity_address(&self) -> Option<LeAddress> {
        match self {
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                let kind = match *address_type {
                    PUBLIC_DEVICE_ADDRESS => AddressType::Public,
                    RANDOM_DEVICE_ADDRESS => AddressType::Random,
                    _ => return None,
                };
                Some(LeAddress::new(kind, *address))
            }
            _ => None,
        }
    }
}

/// Incremental reassembler for SMP PDUs arriving over a byte stream
///
/// The opcode byte fixes the frame size, so no length prefix is needed.
#[derive(Debug, Default)]
pub struct PduAssembler {
    buffer: Vec<u8>,
    remaining: usize,
}

impl PduAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns the decoded PDU, or a decode error for an
    /// unknown opcode, once a frame is complete.
    pub fn push(&mut self, byte: u8) -> Option<Result<SmpPdu, DecodeError>> {
        if self.buffer.is_empty() {
            let size = match pdu_size(byte) {
                Some(size) => size,
                None => return Some(Err(DecodeError::UnknownOpcode(byte))),
            };
            self.buffer.reserve(size);
            self.remaining = size;
        }

        self.buffer.push(byte);
        self.remaining -= 1;

        if self.remaining > 0 {
            return None;
        }

        let frame = std::mem::take(&mut self.buffer);
        Some(SmpPdu::decode(&frame))
    }

    /// Number of bytes still needed for the current frame
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Drop a partially received frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> PairingParameters {
        PairingParameters {
            io_capability: 0x01,
            oob_data_flag: 0x00,
            auth_req: 0x0D,
            max_key_size: 16,
            initiator_key_distribution: 0x07,
            responder_key_distribution: 0x03,
        }
    }

    fn all_pdus() -> Vec<SmpPdu> {
        vec![
            SmpPdu::PairingRequest(sample_params()),
            SmpPdu::PairingResponse(sample_params()),
            SmpPdu::PairingConfirm([0x11; 16]),
            SmpPdu::PairingRandom([0x22; 16]),
            SmpPdu::PairingFailed(FailureReason::ConfirmValueFailed),
            SmpPdu::EncryptionInformation([0x33; 16]),
            SmpPdu::MasterIdentification {
                ediv: 0xBEEF,
                rand: [1, 2, 3, 4, 5, 6, 7, 8],
            },
            SmpPdu::IdentityInformation([0x44; 16]),
            SmpPdu::IdentityAddressInformation {
                address_type: 0x01,
                address: BdAddr::new([1, 2, 3, 4, 5, 0xC6]),
            },
            SmpPdu::SigningInformation([0x55; 16]),
            SmpPdu::SecurityRequest { auth_req: 0x05 },
            SmpPdu::PairingPublicKey {
                x: [0x66; 32],
                y: [0x77; 32],
            },
            SmpPdu::PairingDhKeyCheck([0x88; 16]),
            SmpPdu::KeypressNotification(SMP_KEYPRESS_DIGIT_ENTERED),
        ]
    }

    #[test]
    fn test_round_trip_all_opcodes() {
        for pdu in all_pdus() {
            let bytes = pdu.encode();
            assert_eq!(Some(bytes.len()), pdu_size(pdu.opcode()));
            assert_eq!(SmpPdu::decode(&bytes), Ok(pdu));
        }
    }

    #[test]
    fn test_pairing_request_layout() {
        let bytes = [0x01, 0x03, 0x00, 0x01, 0x10, 0x07, 0x07];
        let pdu = SmpPdu::decode(&bytes).unwrap();
        match &pdu {
            SmpPdu::PairingRequest(params) => {
                assert_eq!(params.io(), Some(IoCapability::NoInputNoOutput));
                assert!(params.auth().bonding);
                assert!(!params.auth().mitm);
                assert_eq!(params.max_key_size, 16);
                assert_eq!(
                    params.initiator_keys(),
                    KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY | KeyDistribution::SIGN_KEY
                );
            }
            other => panic!("unexpected PDU {:?}", other),
        }
        assert_eq!(pdu.encode(), bytes);
    }

    #[test]
    fn test_master_identification_is_little_endian() {
        let pdu = SmpPdu::MasterIdentification {
            ediv: 0x1234,
            rand: [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7],
        };
        assert_eq!(
            pdu.encode(),
            vec![0x07, 0x34, 0x12, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]
        );
    }

    #[test]
    fn test_truncated_and_oversized_input() {
        assert_eq!(
            SmpPdu::decode(&[]),
            Err(DecodeError::Truncated {
                expected: 1,
                actual: 0
            })
        );

        for pdu in all_pdus() {
            let bytes = pdu.encode();
            for len in 1..bytes.len() {
                assert_eq!(
                    SmpPdu::decode(&bytes[..len]),
                    Err(DecodeError::Truncated {
                        expected: bytes.len(),
                        actual: len
                    })
                );
            }

            let mut long = bytes.clone();
            long.push(0x00);
            assert_eq!(
                SmpPdu::decode(&long),
                Err(DecodeError::InvalidLength {
                    expected: bytes.len(),
                    actual: bytes.len() + 1
                })
            );
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(SmpPdu::decode(&[0x00]), Err(DecodeError::UnknownOpcode(0x00)));
        assert_eq!(
            SmpPdu::decode(&[0x0F, 0x00]),
            Err(DecodeError::UnknownOpcode(0x0F))
        );
    }

    #[test]
    fn test_out_of_range_fields_are_preserved() {
        let bytes = [0x02, 0x07, 0x02, 0x00, 0x05, 0x00, 0x00];
        let pdu = SmpPdu::decode(&bytes).unwrap();
        assert_eq!(pdu.validate(), Err(InvalidField::IoCapability(0x07)));
        assert_eq!(pdu.encode(), bytes);

        let mut params = sample_params();
        params.oob_data_flag = 0x02;
        assert_eq!(
            SmpPdu::PairingRequest(params).validate(),
            Err(InvalidField::OobDataFlag(0x02))
        );

        params.oob_data_flag = 0x00;
        params.max_key_size = 6;
        assert_eq!(
            SmpPdu::PairingRequest(params).validate(),
            Err(InvalidField::MaxKeySize(6))
        );

        params.max_key_size = 16;
        for auth_req in [0x02, 0x03, 0x0E] {
            params.auth_req = auth_req;
            assert_eq!(
                SmpPdu::PairingResponse(params).validate(),
                Err(InvalidField::BondingFlags(auth_req & 0x03))
            );
        }

        let pdu = SmpPdu::decode(&[0x09, 0x02, 1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(pdu.validate(), Err(InvalidField::AddressType(0x02)));
        assert_eq!(pdu.identity_address(), None);

        let pdu = SmpPdu::decode(&[0x09, 0x03, 1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(pdu.validate(), Err(InvalidField::AddressType(0x03)));
        assert_eq!(pdu.identity_address(), None);

        assert_eq!(
            SmpPdu::KeypressNotification(0x05).validate(),
            Err(InvalidField::KeypressType(0x05))
        );
    }

    #[test]
    fn test_unknown_failure_reason_is_kept() {
        let pdu = SmpPdu::decode(&[0x05, 0x42]).unwrap();
        assert_eq!(pdu, SmpPdu::PairingFailed(FailureReason::Reserved(0x42)));
        assert_eq!(pdu.encode(), vec![0x05, 0x42]);
    }

    #[test]
    fn test_assembler_yields_frames() {
        let mut stream = SmpPdu::PairingConfirm([0xAB; 16]).encode();
        stream.extend(SmpPdu::SecurityRequest { auth_req: 0x01 }.encode());

        let mut assembler = PduAssembler::new();
        let mut frames = Vec::new();
        for byte in stream {
            if let Some(result) = assembler.push(byte) {
                frames.push(result.unwrap());
            }
        }

        assert_eq!(
            frames,
            vec![
                SmpPdu::PairingConfirm([0xAB; 16]),
                SmpPdu::SecurityRequest { auth_req: 0x01 }
            ]
        );
        assert_eq!(assembler.remaining(), 0);
    }

    #[test]
    fn test_assembler_rejects_unknown_opcode() {
        let mut assembler = PduAssembler::new();
        assert_eq!(assembler.push(0xFF), Some(Err(DecodeError::UnknownOpcode(0xFF))));
        assert!(assembler.push(SMP_PAIRING_FAILED).is_none());
        assert_eq!(assembler.remaining(), 1);
        assembler.reset();
        assert_eq!(assembler.remaining(), 0);
    }
}
