//! Link encryption coordination
//!
//! Bridges pairing and bonding to the controller: starts encryption with a
//! key, answers LTK requests and classifies encryption change events. Holds
//! no key material beyond what is needed to answer one pending request.

use super::constants::*;
use super::keys::{LongTermKey, TagValueStore};
use super::store::BondingStore;
use super::types::*;
use crate::error::TransportError;
use log::{debug, error, info, warn};
use std::collections::HashMap;

/// Encryption primitives of the link layer
pub trait LinkLayer {
    /// Central: encrypt the link with this key (HCI LE Enable Encryption)
    fn start_encryption(
        &mut self,
        handle: ConnectionHandle,
        ltk: &LongTermKey,
    ) -> Result<(), TransportError>;

    /// Peripheral: answer an LTK request (HCI LE Long Term Key Request Reply)
    fn ltk_reply(&mut self, handle: ConnectionHandle, key: &[u8; 16]) -> Result<(), TransportError>;

    /// Peripheral: no key for this request
    fn ltk_negative_reply(&mut self, handle: ConnectionHandle) -> Result<(), TransportError>;
}

impl<T: LinkLayer + ?Sized> LinkLayer for Box<T> {
    fn start_encryption(
        &mut self,
        handle: ConnectionHandle,
        ltk: &LongTermKey,
    ) -> Result<(), TransportError> {
        (**self).start_encryption(handle, ltk)
    }

    fn ltk_reply(&mut self, handle: ConnectionHandle, key: &[u8; 16]) -> Result<(), TransportError> {
        (**self).ltk_reply(handle, key)
    }

    fn ltk_negative_reply(&mut self, handle: ConnectionHandle) -> Result<(), TransportError> {
        (**self).ltk_negative_reply(handle)
    }
}

/// Why the link is being encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPurpose {
    /// With the STK or freshly generated LTK of a pairing attempt
    Pairing,
    /// With the LTK of a stored bond
    Reencryption(SlotIndex),
}

/// How an LTK request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtkAnswer {
    Pairing,
    Bond(SlotIndex),
    NotFound,
}

/// Meaning of an encryption change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionChange {
    /// Belongs to the pairing attempt on this link
    Pairing { status: u8 },
    /// Result of encrypting with a stored bond
    Reencryption {
        slot: SlotIndex,
        result: Result<SecurityLevel, u8>,
    },
    /// Nothing was pending on this link
    Unsolicited { status: u8, enabled: bool },
}

/// Tracks pending encryption per connection
#[derive(Debug)]
pub struct EncryptionCoordinator<L> {
    link: L,
    pending: HashMap<ConnectionHandle, EncryptionPurpose>,
}

impl<L: LinkLayer> EncryptionCoordinator<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            pending: HashMap::new(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// What the link is currently being encrypted for
    pub fn pending(&self, handle: ConnectionHandle) -> Option<EncryptionPurpose> {
        self.pending.get(&handle).copied()
    }

    /// Central: start encryption
    pub fn start(
        &mut self,
        handle: ConnectionHandle,
        ltk: &LongTermKey,
        purpose: EncryptionPurpose,
    ) -> Result<(), TransportError> {
        debug!(
            "Starting encryption on 0x{:04x} for {:?} (EDIV 0x{:04x})",
            handle, purpose, ltk.ediv
        );
        if let Err(e) = self.link.start_encryption(handle, ltk) {
            error!("Failed to start encryption on 0x{:04x}: {}", handle, e);
            return Err(e);
        }
        self.pending.insert(handle, purpose);
        Ok(())
    }

    /// Peripheral: answer an LTK request from the controller
    ///
    /// Lookup order: the key of a pairing attempt waiting for encryption, the
    /// bond matching a non-zero EDIV/Rand, the Secure Connections bond of the
    /// connection's resolved identity.
    pub fn answer_ltk_request<S: TagValueStore>(
        &mut self,
        handle: ConnectionHandle,
        ediv: u16,
        rand: &[u8; 8],
        pairing_key: Option<[u8; 16]>,
        identity: Option<SlotIndex>,
        store: &BondingStore<S>,
    ) -> Result<LtkAnswer, TransportError> {
        let legacy_lookup = ediv != 0 || rand.iter().any(|&b| b != 0);

        if let (Some(key), false) = (pairing_key, legacy_lookup) {
            self.link.ltk_reply(handle, &key)?;
            self.pending.insert(handle, EncryptionPurpose::Pairing);
            return Ok(LtkAnswer::Pairing);
        }

        let slot = if legacy_lookup {
            store.lookup_by_ediv_rand(ediv, rand)
        } else {
            identity.filter(|&slot| {
                store
                    .get(slot)
                    .map_or(false, |entry| entry.secure_connections && entry.ltk.is_some())
            })
        };

        match slot.and_then(|slot| store.get(slot).and_then(|entry| entry.ltk).map(|ltk| (slot, ltk))) {
            Some((slot, ltk)) => {
                debug!("LTK request on 0x{:04x} answered from slot {}", handle, slot);
                self.link.ltk_reply(handle, &ltk.key)?;
                self.pending.insert(handle, EncryptionPurpose::Reencryption(slot));
                Ok(LtkAnswer::Bond(slot))
            }
            None => {
                warn!(
                    "No LTK for 0x{:04x} (EDIV 0x{:04x}, Rand {})",
                    handle,
                    ediv,
                    hex::encode(rand)
                );
                self.link.ltk_negative_reply(handle)?;
                Ok(LtkAnswer::NotFound)
            }
        }
    }

    /// Classify an encryption change (or key refresh) event
    pub fn encryption_changed<S: TagValueStore>(
        &mut self,
        handle: ConnectionHandle,
        status: u8,
        enabled: bool,
        store: &BondingStore<S>,
    ) -> EncryptionChange {
        let status = if status == 0 && !enabled {
            HCI_STATUS_PIN_OR_KEY_MISSING
        } else {
            status
        };

        match self.pending.remove(&handle) {
            Some(EncryptionPurpose::Pairing) => EncryptionChange::Pairing { status },
            Some(EncryptionPurpose::Reencryption(slot)) => {
                let result = if status == 0 {
                    let level = store
                        .get(slot)
                        .map_or(SecurityLevel::EncryptionOnly, |entry| entry.security_level());
                    info!("Link 0x{:04x} re-encrypted with bond {} ({:?})", handle, slot, level);
                    Ok(level)
                } else {
                    if status == HCI_STATUS_PIN_OR_KEY_MISSING {
                        warn!("Peer on 0x{:04x} no longer has the keys of bond {}", handle, slot);
                    }
                    Err(status)
                };
                EncryptionChange::Reencryption { slot, result }
            }
            None => EncryptionChange::Unsolicited { status, enabled },
        }
    }

    pub fn disconnected(&mut self, handle: ConnectionHandle) {
        self.pending.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::LeAddress;
    use crate::smp::keys::{BondingEntry, MemoryTagStore};

    #[derive(Debug, Default)]
    struct RecordingLink {
        started: Vec<(ConnectionHandle, LongTermKey)>,
        replies: Vec<(ConnectionHandle, Option<[u8; 16]>)>,
        refuse: bool,
    }

    impl LinkLayer for RecordingLink {
        fn start_encryption(
            &mut self,
            handle: ConnectionHandle,
            ltk: &LongTermKey,
        ) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::CommandRejected(0x0C));
            }
            self.started.push((handle, *ltk));
            Ok(())
        }

        fn ltk_reply(&mut self, handle: ConnectionHandle, key: &[u8; 16]) -> Result<(), TransportError> {
            self.replies.push((handle, Some(*key)));
            Ok(())
        }

        fn ltk_negative_reply(&mut self, handle: ConnectionHandle) -> Result<(), TransportError> {
            self.replies.push((handle, None));
            Ok(())
        }
    }

    fn store() -> BondingStore<MemoryTagStore> {
        let mut store = BondingStore::open(MemoryTagStore::new(), 4);

        let mut legacy = BondingEntry::new(LeAddress::public([1, 1, 1, 1, 1, 1]));
        legacy.ltk = Some(LongTermKey::new([0x11; 16], 0x1234, [7; 8]));
        legacy.key_size = 16;
        store.add(legacy).unwrap();

        let mut secure = BondingEntry::new(LeAddress::public([2, 2, 2, 2, 2, 2]));
        secure.ltk = Some(LongTermKey::new_secure_connections([0x22; 16]));
        secure.secure_connections = true;
        secure.authenticated = true;
        secure.key_size = 16;
        store.add(secure).unwrap();

        store
    }

    #[test]
    fn test_ltk_request_lookup_order() {
        let store = store();
        let mut coordinator = EncryptionCoordinator::new(RecordingLink::default());

        let answer = coordinator
            .answer_ltk_request(1, 0x1234, &[7; 8], None, None, &store)
            .unwrap();
        assert_eq!(answer, LtkAnswer::Bond(0));

        let answer = coordinator
            .answer_ltk_request(2, 0, &[0; 8], None, Some(1), &store)
            .unwrap();
        assert_eq!(answer, LtkAnswer::Bond(1));

        // Legacy bonds are never resumed with a zero EDIV/Rand
        let answer = coordinator
            .answer_ltk_request(3, 0, &[0; 8], None, Some(0), &store)
            .unwrap();
        assert_eq!(answer, LtkAnswer::NotFound);

        let answer = coordinator
            .answer_ltk_request(4, 0, &[0; 8], Some([0x44; 16]), Some(1), &store)
            .unwrap();
        assert_eq!(answer, LtkAnswer::Pairing);

        assert_eq!(
            coordinator.link().replies,
            vec![
                (1, Some([0x11; 16])),
                (2, Some([0x22; 16])),
                (3, None),
                (4, Some([0x44; 16])),
            ]
        );
    }

    #[test]
    fn test_encryption_change_classification() {
        let store = store();
        let mut coordinator = EncryptionCoordinator::new(RecordingLink::default());

        coordinator
            .start(1, &LongTermKey::new([0; 16], 0, [0; 8]), EncryptionPurpose::Pairing)
            .unwrap();
        assert_eq!(
            coordinator.encryption_changed(1, 0, true, &store),
            EncryptionChange::Pairing { status: 0 }
        );

        coordinator
            .start(2, &LongTermKey::new_secure_connections([0x22; 16]), EncryptionPurpose::Reencryption(1))
            .unwrap();
        assert_eq!(
            coordinator.encryption_changed(2, 0, true, &store),
            EncryptionChange::Reencryption {
                slot: 1,
                result: Ok(SecurityLevel::SecureConnections)
            }
        );

        coordinator
            .start(3, &LongTermKey::new([0x11; 16], 0x1234, [7; 8]), EncryptionPurpose::Reencryption(0))
            .unwrap();
        assert_eq!(
            coordinator.encryption_changed(3, HCI_STATUS_PIN_OR_KEY_MISSING, false, &store),
            EncryptionChange::Reencryption {
                slot: 0,
                result: Err(HCI_STATUS_PIN_OR_KEY_MISSING)
            }
        );

        assert_eq!(
            coordinator.encryption_changed(3, 0, true, &store),
            EncryptionChange::Unsolicited {
                status: 0,
                enabled: true
            }
        );
    }

    #[test]
    fn test_failed_start_leaves_nothing_pending() {
        let mut coordinator = EncryptionCoordinator::new(RecordingLink {
            refuse: true,
            ..Default::default()
        });

        assert!(coordinator
            .start(1, &LongTermKey::new([0; 16], 0, [0; 8]), EncryptionPurpose::Pairing)
            .is_err());
        assert_eq!(coordinator.pending(1), None);
    }
}
