//! Key management for Security Manager Protocol
//!
//! This module holds the keys exchanged during key distribution, the bonding
//! entry built from them, its fixed-size persisted record, and the tag/value
//! storage trait the bonding store writes records through.

use super::constants::*;
use super::store::StoreError;
use super::types::SecurityLevel;
use crate::gap::{AddressType, BdAddr, LeAddress};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

/// Long Term Key with the EDIV/Rand pair that identifies it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongTermKey {
    /// Key value, little-endian
    pub key: [u8; 16],
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// RAND (Random number)
    pub rand: [u8; 8],
}

impl LongTermKey {
    /// Create a new Long Term Key
    pub fn new(key: [u8; 16], ediv: u16, rand: [u8; 8]) -> Self {
        Self { key, ediv, rand }
    }

    /// Secure Connections keys are always referenced with EDIV = 0, Rand = 0
    pub fn new_secure_connections(key: [u8; 16]) -> Self {
        Self::new(key, 0, [0; 8])
    }

    pub fn matches(&self, ediv: u16, rand: &[u8; 8]) -> bool {
        self.ediv == ediv && self.rand == *rand
    }
}

/// Connection Signature Resolving Key (CSRK)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningKey {
    /// Key value
    pub key: [u8; 16],
    /// Counter for signed data
    pub counter: u32,
}

impl SigningKey {
    /// Create a new signing key with its counter reset
    pub fn new(key: [u8; 16]) -> Self {
        Self { key, counter: 0 }
    }

    /// Increment the signing counter
    pub fn increment_counter(&mut self) -> u32 {
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }
}

/// Keys carried by the key distribution phase in one direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributedKeys {
    pub ltk: Option<[u8; 16]>,
    pub ediv_rand: Option<(u16, [u8; 8])>,
    pub irk: Option<[u8; 16]>,
    pub identity: Option<LeAddress>,
    pub csrk: Option<[u8; 16]>,
}

impl DistributedKeys {
    /// The LTK with its EDIV/Rand, once both PDUs have been seen
    pub fn long_term_key(&self) -> Option<LongTermKey> {
        match (self.ltk, self.ediv_rand) {
            (Some(key), Some((ediv, rand))) => Some(LongTermKey::new(key, ediv, rand)),
            _ => None,
        }
    }
}

/// A bonded peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondingEntry {
    /// Identity address of the peer
    pub address: LeAddress,
    /// Identity Resolving Key, little-endian
    pub irk: Option<[u8; 16]>,
    pub ltk: Option<LongTermKey>,
    pub key_size: u8,
    pub authenticated: bool,
    pub authorized: bool,
    pub secure_connections: bool,
    pub local_csrk: Option<SigningKey>,
    pub remote_csrk: Option<SigningKey>,
}

impl BondingEntry {
    /// Create an entry with no key material
    pub fn new(address: LeAddress) -> Self {
        Self {
            address,
            irk: None,
            ltk: None,
            key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            authenticated: false,
            authorized: false,
            secure_connections: false,
            local_csrk: None,
            remote_csrk: None,
        }
    }

    /// Security level reached when encrypting with this entry's LTK
    pub fn security_level(&self) -> SecurityLevel {
        SecurityLevel::from_link(
            self.ltk.is_some(),
            self.authenticated,
            self.secure_connections,
        )
    }

    /// Serialize to the fixed-size persisted record
    pub fn to_record(&self) -> [u8; SMP_BOND_RECORD_SIZE] {
        let mut record = [0u8; SMP_BOND_RECORD_SIZE];
        let mut flags = 0;

        if self.authenticated {
            flags |= SMP_BOND_FLAG_AUTHENTICATED;
        }
        if self.authorized {
            flags |= SMP_BOND_FLAG_AUTHORIZED;
        }
        if self.secure_connections {
            flags |= SMP_BOND_FLAG_SECURE_CONNECTIONS;
        }

        record[1] = self.address.address_type.to_u8();
        record[2..8].copy_from_slice(self.address.address.as_slice());

        if let Some(irk) = &self.irk {
            flags |= SMP_BOND_FLAG_IRK;
            record[8..24].copy_from_slice(irk);
        }
        if let Some(ltk) = &self.ltk {
            flags |= SMP_BOND_FLAG_LTK;
            record[24..40].copy_from_slice(&ltk.key);
            LittleEndian::write_u16(&mut record[40..42], ltk.ediv);
            record[42..50].copy_from_slice(&ltk.rand);
        }
        record[50] = self.key_size;
        if let Some(csrk) = &self.local_csrk {
            flags |= SMP_BOND_FLAG_LOCAL_CSRK;
            record[51..67].copy_from_slice(&csrk.key);
            LittleEndian::write_u32(&mut record[67..71], csrk.counter);
        }
        if let Some(csrk) = &self.remote_csrk {
            flags |= SMP_BOND_FLAG_REMOTE_CSRK;
            record[71..87].copy_from_slice(&csrk.key);
            LittleEndian::write_u32(&mut record[87..91], csrk.counter);
        }

        record[0] = flags;
        record
    }

    /// Parse a persisted record. Returns `None` if it is malformed.
    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() != SMP_BOND_RECORD_SIZE {
            return None;
        }

        let flags = record[0];
        if flags & 0x80 != 0 {
            return None;
        }
        let address_type = match record[1] {
            0x00 => AddressType::Public,
            0x01 => AddressType::Random,
            _ => return None,
        };
        let address = LeAddress::new(address_type, BdAddr::from_slice(&record[2..8])?);

        let key16 = |range: std::ops::Range<usize>| {
            let mut key = [0u8; 16];
            key.copy_from_slice(&record[range]);
            key
        };

        let irk = (flags & SMP_BOND_FLAG_IRK != 0).then(|| key16(8..24));
        let ltk = (flags & SMP_BOND_FLAG_LTK != 0).then(|| {
            let mut rand = [0u8; 8];
            rand.copy_from_slice(&record[42..50]);
            LongTermKey::new(key16(24..40), LittleEndian::read_u16(&record[40..42]), rand)
        });
        let local_csrk = (flags & SMP_BOND_FLAG_LOCAL_CSRK != 0).then(|| SigningKey {
            key: key16(51..67),
            counter: LittleEndian::read_u32(&record[67..71]),
        });
        let remote_csrk = (flags & SMP_BOND_FLAG_REMOTE_CSRK != 0).then(|| SigningKey {
            key: key16(71..87),
            counter: LittleEndian::read_u32(&record[87..91]),
        });

        Some(Self {
            address,
            irk,
            ltk,
            key_size: record[50],
            authenticated: flags & SMP_BOND_FLAG_AUTHENTICATED != 0,
            authorized: flags & SMP_BOND_FLAG_AUTHORIZED != 0,
            secure_connections: flags & SMP_BOND_FLAG_SECURE_CONNECTIONS != 0,
            local_csrk,
            remote_csrk,
        })
    }
}

/// Generic tag/value persistence used by the bonding store
///
/// A write must be durable once `store_tag` returns `Ok`.
pub trait TagValueStore {
    /// Store a value under a tag, replacing any previous value
    fn store_tag(&mut self, tag: u32, value: &[u8]) -> Result<(), StoreError>;

    /// Read the value stored under a tag
    fn get_tag(&self, tag: u32) -> Option<Vec<u8>>;

    /// Delete a tag. Deleting a missing tag is not an error.
    fn delete_tag(&mut self, tag: u32) -> Result<(), StoreError>;
}

/// In-memory implementation of TagValueStore
#[derive(Debug, Default, Clone)]
pub struct MemoryTagStore {
    tags: HashMap<u32, Vec<u8>>,
}

impl MemoryTagStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl TagValueStore for MemoryTagStore {
    fn store_tag(&mut self, tag: u32, value: &[u8]) -> Result<(), StoreError> {
        self.tags.insert(tag, value.to_vec());
        Ok(())
    }

    fn get_tag(&self, tag: u32) -> Option<Vec<u8>> {
        self.tags.get(&tag).cloned()
    }

    fn delete_tag(&mut self, tag: u32) -> Result<(), StoreError> {
        self.tags.remove(&tag);
        Ok(())
    }
}

impl<T: TagValueStore + ?Sized> TagValueStore for Box<T> {
    fn store_tag(&mut self, tag: u32, value: &[u8]) -> Result<(), StoreError> {
        (**self).store_tag(tag, value)
    }

    fn get_tag(&self, tag: u32) -> Option<Vec<u8>> {
        (**self).get_tag(tag)
    }

    fn delete_tag(&mut self, tag: u32) -> Result<(), StoreError> {
        (**self).delete_tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_entry() -> BondingEntry {
        BondingEntry {
            address: LeAddress::random([1, 2, 3, 4, 5, 0xC6]),
            irk: Some([0x11; 16]),
            ltk: Some(LongTermKey::new([0x22; 16], 0xA55A, [1, 2, 3, 4, 5, 6, 7, 8])),
            key_size: 12,
            authenticated: true,
            authorized: false,
            secure_connections: false,
            local_csrk: Some(SigningKey {
                key: [0x33; 16],
                counter: 7,
            }),
            remote_csrk: Some(SigningKey {
                key: [0x44; 16],
                counter: 0x0102_0304,
            }),
        }
    }

    #[test]
    fn test_record_layout() {
        let record = full_entry().to_record();
        assert_eq!(record.len(), 91);
        assert_eq!(
            record[0],
            SMP_BOND_FLAG_AUTHENTICATED
                | SMP_BOND_FLAG_IRK
                | SMP_BOND_FLAG_LTK
                | SMP_BOND_FLAG_LOCAL_CSRK
                | SMP_BOND_FLAG_REMOTE_CSRK
        );
        assert_eq!(record[1], 0x01);
        assert_eq!(&record[2..8], &[1, 2, 3, 4, 5, 0xC6]);
        assert_eq!(&record[40..42], &[0x5A, 0xA5]);
        assert_eq!(record[50], 12);
        assert_eq!(&record[87..91], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(BondingEntry::from_record(&record), Some(full_entry()));
    }

    #[test]
    fn test_minimal_entry_record() {
        let entry = BondingEntry::new(LeAddress::public([9, 8, 7, 6, 5, 4]));
        let record = entry.to_record();
        assert_eq!(record[0], 0);
        assert_eq!(BondingEntry::from_record(&record), Some(entry));
    }

    #[test]
    fn test_malformed_records() {
        let record = full_entry().to_record();
        assert_eq!(BondingEntry::from_record(&record[..90]), None);

        let mut bad_type = record;
        bad_type[1] = 0x05;
        assert_eq!(BondingEntry::from_record(&bad_type), None);

        let mut bad_flags = record;
        bad_flags[0] |= 0x80;
        assert_eq!(BondingEntry::from_record(&bad_flags), None);
    }

    #[test]
    fn test_security_level() {
        let mut entry = full_entry();
        assert_eq!(
            entry.security_level(),
            SecurityLevel::EncryptionWithAuthentication
        );
        entry.secure_connections = true;
        assert_eq!(entry.security_level(), SecurityLevel::SecureConnections);
        entry.ltk = None;
        assert_eq!(entry.security_level(), SecurityLevel::None);
    }

    #[test]
    fn test_distributed_keys_need_both_pdus() {
        let mut keys = DistributedKeys {
            ltk: Some([0x55; 16]),
            ..Default::default()
        };
        assert_eq!(keys.long_term_key(), None);
        keys.ediv_rand = Some((0x1234, [9; 8]));
        assert_eq!(
            keys.long_term_key(),
            Some(LongTermKey::new([0x55; 16], 0x1234, [9; 8]))
        );
    }

    #[test]
    fn test_signing_counter() {
        let mut csrk = SigningKey::new([0; 16]);
        assert_eq!(csrk.increment_counter(), 1);
        assert_eq!(csrk.increment_counter(), 2);
    }
}
