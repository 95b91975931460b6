//! Bonding store
//!
//! A bounded table of bonded peers. Slot indices are stable until a bond is
//! explicitly removed. Every mutation is written to the tag/value backend
//! before the in-memory table changes, and `open` rebuilds the table from the
//! persisted tags alone.

use super::constants::*;
use super::crypto;
use super::keys::{BondingEntry, TagValueStore};
use super::types::SlotIndex;
use crate::gap::{BdAddr, LeAddress};
use log::{debug, info, warn};
use thiserror::Error;

/// Bonding store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("bonding store full ({0} slots)")]
    Full(usize),

    #[error("invalid bonding slot {0}")]
    InvalidSlot(SlotIndex),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("corrupt bonding record in slot {0}")]
    CorruptRecord(SlotIndex),
}

/// Persistence tag for a slot
pub fn slot_tag(slot: SlotIndex) -> u32 {
    SMP_BOND_TAG_PREFIX | (slot as u32 & 0xFF)
}

/// Fixed-capacity table of bonding entries
#[derive(Debug)]
pub struct BondingStore<S> {
    backend: S,
    slots: Vec<Option<BondingEntry>>,
}

impl<S: TagValueStore> BondingStore<S> {
    /// Open the store, rebuilding the table by scanning the persisted tags
    pub fn open(backend: S, capacity: usize) -> Self {
        let capacity = if capacity > SMP_BOND_MAX_SLOTS {
            warn!(
                "Bonding store capacity {} exceeds {} slots, clamping",
                capacity, SMP_BOND_MAX_SLOTS
            );
            SMP_BOND_MAX_SLOTS
        } else {
            capacity
        };

        let mut slots = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let entry = backend.get_tag(slot_tag(slot)).and_then(|record| {
                let entry = BondingEntry::from_record(&record);
                if entry.is_none() {
                    warn!("{}, treating slot as free", StoreError::CorruptRecord(slot));
                }
                entry
            });
            slots.push(entry);
        }

        let store = Self { backend, slots };
        debug!(
            "Opened bonding store: {}/{} slots in use",
            store.len(),
            store.capacity()
        );
        store
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, slot: SlotIndex) -> Option<&BondingEntry> {
        self.slots.get(slot).and_then(|entry| entry.as_ref())
    }

    /// Occupied slots in index order
    pub fn entries(&self) -> impl Iterator<Item = (SlotIndex, &BondingEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (slot, entry)))
    }

    /// Copy of every occupied slot, for diagnostics
    pub fn dump(&self) -> Vec<(SlotIndex, BondingEntry)> {
        self.entries()
            .map(|(slot, entry)| (slot, entry.clone()))
            .collect()
    }

    /// Slot holding the given identity address
    pub fn lookup_by_identity(&self, address: &LeAddress) -> Option<SlotIndex> {
        self.entries()
            .find(|(_, entry)| entry.address == *address)
            .map(|(slot, _)| slot)
    }

    /// Slot whose LTK is identified by this EDIV/Rand pair
    pub fn lookup_by_ediv_rand(&self, ediv: u16, rand: &[u8; 8]) -> Option<SlotIndex> {
        self.entries()
            .find(|(_, entry)| entry.ltk.map_or(false, |ltk| ltk.matches(ediv, rand)))
            .map(|(slot, _)| slot)
    }

    /// Slot whose IRK resolves a resolvable private address
    pub fn resolve_address(&self, address: &BdAddr) -> Option<SlotIndex> {
        self.entries()
            .find(|(_, entry)| {
                entry
                    .irk
                    .as_ref()
                    .map_or(false, |irk| crypto::resolve_private_address(irk, address))
            })
            .map(|(slot, _)| slot)
    }

    /// Store a bond. An entry for the same identity is replaced in its slot,
    /// otherwise the first free slot is used.
    pub fn add(&mut self, entry: BondingEntry) -> Result<SlotIndex, StoreError> {
        let slot = match self.lookup_by_identity(&entry.address) {
            Some(slot) => slot,
            None => self
                .slots
                .iter()
                .position(|slot| slot.is_none())
                .ok_or(StoreError::Full(self.capacity()))?,
        };

        self.write(slot, entry)?;
        info!("Stored bond in slot {}", slot);
        Ok(slot)
    }

    /// Replace the key material of an occupied slot
    pub fn update(&mut self, slot: SlotIndex, entry: BondingEntry) -> Result<(), StoreError> {
        if self.get(slot).is_none() {
            return Err(StoreError::InvalidSlot(slot));
        }
        if let Some(other) = self.lookup_by_identity(&entry.address) {
            if other != slot {
                return Err(StoreError::InvalidSlot(slot));
            }
        }

        self.write(slot, entry)?;
        debug!("Updated bond in slot {}", slot);
        Ok(())
    }

    /// Free a slot. Other slots keep their indices.
    pub fn remove(&mut self, slot: SlotIndex) -> Result<BondingEntry, StoreError> {
        if self.get(slot).is_none() {
            return Err(StoreError::InvalidSlot(slot));
        }

        self.backend.delete_tag(slot_tag(slot))?;
        let entry = self.slots[slot]
            .take()
            .ok_or(StoreError::InvalidSlot(slot))?;
        info!("Removed bond in slot {} ({})", slot, entry.address);
        Ok(entry)
    }

    /// Access the persistence backend
    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Close the store and hand the backend back
    pub fn into_backend(self) -> S {
        self.backend
    }

    fn write(&mut self, slot: SlotIndex, entry: BondingEntry) -> Result<(), StoreError> {
        self.backend.store_tag(slot_tag(slot), &entry.to_record())?;
        self.slots[slot] = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::keys::{LongTermKey, MemoryTagStore};

    fn entry(last: u8) -> BondingEntry {
        let mut entry = BondingEntry::new(LeAddress::public([1, 2, 3, 4, 5, last]));
        entry.ltk = Some(LongTermKey::new([last; 16], u16::from(last), [last; 8]));
        entry
    }

    /// Backend whose writes can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryTagStore,
        fail: bool,
    }

    impl TagValueStore for FlakyStore {
        fn store_tag(&mut self, tag: u32, value: &[u8]) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Persistence("write refused".into()));
            }
            self.inner.store_tag(tag, value)
        }

        fn get_tag(&self, tag: u32) -> Option<Vec<u8>> {
            self.inner.get_tag(tag)
        }

        fn delete_tag(&mut self, tag: u32) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Persistence("delete refused".into()));
            }
            self.inner.delete_tag(tag)
        }
    }

    #[test]
    fn test_slot_tag() {
        assert_eq!(slot_tag(0), 0x4254_4400);
        assert_eq!(slot_tag(3), 0x4254_4403);
    }

    #[test]
    fn test_full_store_rejects_without_corruption() {
        let mut store = BondingStore::open(MemoryTagStore::new(), 3);
        for last in 0..3 {
            assert_eq!(store.add(entry(last)), Ok(usize::from(last)));
        }
        let before = store.dump();

        assert_eq!(store.add(entry(9)), Err(StoreError::Full(3)));
        assert_eq!(store.dump(), before);
        assert_eq!(store.backend().len(), 3);
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut store = BondingStore::open(MemoryTagStore::new(), 3);
        for last in 0..3 {
            store.add(entry(last)).unwrap();
        }

        let removed = store.remove(1).unwrap();
        assert_eq!(removed.address, entry(1).address);
        assert_eq!(store.get(1), None);
        assert_eq!(store.get(2), Some(&entry(2)));

        assert_eq!(store.add(entry(7)), Ok(1));
        assert_eq!(store.lookup_by_identity(&entry(7).address), Some(1));
    }

    #[test]
    fn test_duplicate_identity_reuses_slot() {
        let mut store = BondingStore::open(MemoryTagStore::new(), 2);
        assert_eq!(store.add(entry(4)), Ok(0));

        let mut refreshed = entry(4);
        refreshed.ltk = Some(LongTermKey::new_secure_connections([0xEE; 16]));
        refreshed.secure_connections = true;
        assert_eq!(store.add(refreshed.clone()), Ok(0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0), Some(&refreshed));
    }

    #[test]
    fn test_reload_matches_table() {
        let mut store = BondingStore::open(MemoryTagStore::new(), 4);
        for last in 0..4 {
            store.add(entry(last)).unwrap();
        }
        store.remove(2).unwrap();
        let mut authorized = entry(3);
        authorized.authorized = true;
        store.update(3, authorized).unwrap();

        let before = store.dump();
        let reopened = BondingStore::open(store.into_backend(), 4);
        assert_eq!(reopened.dump(), before);
        assert!(reopened.get(3).unwrap().authorized);
    }

    #[test]
    fn test_corrupt_record_is_free() {
        let mut backend = MemoryTagStore::new();
        backend.store_tag(slot_tag(0), &[0xFF; 10]).unwrap();
        backend
            .store_tag(slot_tag(1), &entry(1).to_record())
            .unwrap();

        let mut store = BondingStore::open(backend, 2);
        assert_eq!(store.get(0), None);
        assert_eq!(store.get(1), Some(&entry(1)));
        assert_eq!(store.add(entry(5)), Ok(0));
    }

    #[test]
    fn test_failed_write_leaves_table_unchanged() {
        let mut store = BondingStore::open(FlakyStore::default(), 2);
        store.add(entry(1)).unwrap();

        store.backend.fail = true;
        assert!(matches!(
            store.add(entry(2)),
            Err(StoreError::Persistence(_))
        ));
        assert!(store.remove(0).is_err());
        assert_eq!(store.len(), 1);

        store.backend.fail = false;
        let reopened = BondingStore::open(store.into_backend(), 2);
        assert_eq!(reopened.dump(), vec![(0, entry(1))]);
    }

    #[test]
    fn test_lookups() {
        let irk = 0x8b3958c1_58ed6446_7bd27bc9_0d3cf54d_u128.to_le_bytes();
        let mut store = BondingStore::open(MemoryTagStore::new(), 4);
        store.add(entry(1)).unwrap();
        let mut with_irk = entry(2);
        with_irk.irk = Some(irk);
        store.add(with_irk).unwrap();

        assert_eq!(store.lookup_by_ediv_rand(2, &[2; 8]), Some(1));
        assert_eq!(store.lookup_by_ediv_rand(2, &[3; 8]), None);

        let rpa = BdAddr::new([0x92, 0xF2, 0x8F, 0x84, 0x72, 0x4F]);
        assert_eq!(store.resolve_address(&rpa), Some(1));
        assert_eq!(store.resolve_address(&BdAddr::new([0; 6])), None);

        assert_eq!(store.update(3, entry(3)), Err(StoreError::InvalidSlot(3)));
        assert_eq!(store.update(0, entry(2)), Err(StoreError::InvalidSlot(0)));
        assert_eq!(store.remove(9), Err(StoreError::InvalidSlot(9)));
    }
}
