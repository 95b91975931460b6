use crate::gap::constants::*;
use std::fmt;

/// Over-the-air address type as carried in SMP and HCI LE commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn to_u8(self) -> u8 {
        match self {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
        }
    }

    /// Identity address types reported by a controller-side resolver map onto
    /// their base type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            PUBLIC_DEVICE_ADDRESS | PUBLIC_IDENTITY_ADDRESS => Some(AddressType::Public),
            RANDOM_DEVICE_ADDRESS | RANDOM_IDENTITY_ADDRESS => Some(AddressType::Random),
            _ => None,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
        }
    }
}

/// Bluetooth device address, stored little-endian as it appears on air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Address bytes with the most significant octet first.
    pub fn to_be_bytes(&self) -> [u8; 6] {
        let mut be = self.bytes;
        be.reverse();
        be
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// An LE device address together with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeAddress {
    pub address_type: AddressType,
    pub address: BdAddr,
}

impl LeAddress {
    pub fn new(address_type: AddressType, address: BdAddr) -> Self {
        Self {
            address_type,
            address,
        }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Public, BdAddr::new(bytes))
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Random, BdAddr::new(bytes))
    }

    /// The 56-bit `type || address` encoding used by the f5 and f6 functions,
    /// most significant octet first.
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = self.address_type.to_u8();
        out[1..].copy_from_slice(&self.address.to_be_bytes());
        out
    }

    fn random_subtype(&self) -> u8 {
        self.address.bytes[5] & RANDOM_ADDRESS_SUBTYPE_MASK
    }

    /// Resolvable private addresses carry `0b01` in the two most significant bits.
    pub fn is_resolvable_private(&self) -> bool {
        self.address_type == AddressType::Random
            && self.random_subtype() == RANDOM_ADDRESS_SUBTYPE_RESOLVABLE
    }

    pub fn is_static_random(&self) -> bool {
        self.address_type == AddressType::Random
            && self.random_subtype() == RANDOM_ADDRESS_SUBTYPE_STATIC
    }

    /// Public and static random addresses are stable identities.
    pub fn is_identity(&self) -> bool {
        self.address_type == AddressType::Public || self.is_static_random()
    }
}

impl fmt::Display for LeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.address_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_byte_order() {
        let addr = LeAddress::public([0xce, 0xbf, 0x37, 0x37, 0x12, 0x56]);
        assert_eq!(addr.to_bytes(), [0x00, 0x56, 0x12, 0x37, 0x37, 0xbf, 0xce]);
        assert_eq!(addr.address.to_string(), "56:12:37:37:BF:CE");
    }

    #[test]
    fn test_random_address_classification() {
        let rpa = LeAddress::random([0x92, 0xF2, 0x8F, 0x84, 0x72, 0x4F]);
        assert!(rpa.is_resolvable_private());
        assert!(!rpa.is_identity());

        let static_random = LeAddress::random([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
        assert!(static_random.is_static_random());
        assert!(static_random.is_identity());

        let public = LeAddress::public([0x01, 0x02, 0x03, 0x04, 0x05, 0x46]);
        assert!(public.is_identity());
        assert!(!public.is_resolvable_private());
    }

    #[test]
    fn test_address_type_conversion() {
        assert_eq!(AddressType::from_u8(0x00), Some(AddressType::Public));
        assert_eq!(AddressType::from_u8(0x03), Some(AddressType::Random));
        assert_eq!(AddressType::from_u8(0x04), None);
        assert_eq!(AddressType::Random.to_u8(), 0x01);
    }
}
