//! Security Manager Protocol manager implementation
//!
//! This module provides the main interface for the SMP module. The manager
//! keeps one record per connection handle, creates and destroys pairing
//! contexts, routes PDUs, link events and user responses to them, and carries
//! out the actions they request against the transport, the link layer, the
//! bonding store and the registered event handlers.

use super::constants::*;
use super::crypto::{self, CryptoProvider, CryptoResponse, CryptoToken};
use super::encryption::{EncryptionChange, EncryptionCoordinator, EncryptionPurpose, LinkLayer, LtkAnswer};
use super::keys::{BondingEntry, MemoryTagStore, TagValueStore};
use super::pairing::{PairingAction, PairingContext, PairingEnv, PairingResult, UserWait};
use super::pdu::{DecodeError, PduAssembler, SmpPdu};
use super::store::{BondingStore, StoreError};
use super::types::*;
use crate::error::TransportError;
use crate::gap::{BdAddr, LeAddress};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::time::Instant;

/// Fixed-channel transport carrying SMP PDUs
pub trait SmpTransport {
    fn send_pdu(&mut self, handle: ConnectionHandle, pdu: &[u8]) -> Result<(), TransportError>;
}

impl<T: SmpTransport + ?Sized> SmpTransport for Box<T> {
    fn send_pdu(&mut self, handle: ConnectionHandle, pdu: &[u8]) -> Result<(), TransportError> {
        (**self).send_pdu(handle, pdu)
    }
}

/// Receiver of Security Manager events, one method per event family
pub trait SmpEventHandler {
    /// The application must answer through the matching manager call
    fn user_request(&mut self, _handle: ConnectionHandle, _peer: &LeAddress, _request: &UserRequest) {}

    fn pairing(&mut self, _event: &PairingEvent) {}

    fn identity(&mut self, _event: &IdentityEvent) {}
}

impl<F: FnMut(&SmpEvent)> SmpEventHandler for F {
    fn user_request(&mut self, handle: ConnectionHandle, peer: &LeAddress, request: &UserRequest) {
        self(&SmpEvent::UserRequest {
            handle,
            peer: *peer,
            request: *request,
        })
    }

    fn pairing(&mut self, event: &PairingEvent) {
        self(&SmpEvent::Pairing(event.clone()))
    }

    fn identity(&mut self, event: &IdentityEvent) {
        self(&SmpEvent::Identity(event.clone()))
    }
}

/// Security state of one connection
struct SmConnection {
    /// Initiator for the central, responder for the peripheral
    role: PairingRole,
    local: LeAddress,
    peer: LeAddress,
    /// Bond this peer resolved to
    identity: Option<SlotIndex>,
    security: SecurityLevel,
    key_size: u8,
    pairing: Option<PairingContext>,
    assembler: PduAssembler,
}

/// Security Manager Protocol manager
pub struct SmpManager<S = MemoryTagStore> {
    /// Applied to pairing attempts started after it is set
    config: SecurityConfig,

    connections: HashMap<ConnectionHandle, SmConnection>,

    store: BondingStore<S>,

    encryption: EncryptionCoordinator<Box<dyn LinkLayer>>,

    transport: Box<dyn SmpTransport>,

    crypto: Box<dyn CryptoProvider>,

    handlers: Vec<Box<dyn SmpEventHandler>>,

    /// Numbers pairing attempts across all connections
    attempts: u32,

    /// r of the last generated Secure Connections OOB data
    local_oob: Option<u128>,
}

impl<S: TagValueStore> SmpManager<S> {
    /// Create a new SMP manager
    pub fn new(
        transport: impl SmpTransport + 'static,
        link: impl LinkLayer + 'static,
        crypto: impl CryptoProvider + 'static,
        store: BondingStore<S>,
    ) -> Self {
        info!(
            "SMP manager started with {}/{} bonds",
            store.len(),
            store.capacity()
        );
        Self {
            config: SecurityConfig::default(),
            connections: HashMap::new(),
            store,
            encryption: EncryptionCoordinator::new(Box::new(link)),
            transport: Box::new(transport),
            crypto: Box::new(crypto),
            handlers: Vec::new(),
            attempts: 0,
            local_oob: None,
        }
    }

    /// Replace the configuration used by future pairing attempts
    pub fn configure(&mut self, config: SecurityConfig) -> SmpResult<()> {
        let key_sizes = SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE;
        if !key_sizes.contains(&config.min_key_size)
            || !key_sizes.contains(&config.max_key_size)
            || config.min_key_size > config.max_key_size
        {
            return Err(SmpError::InvalidParameter(format!(
                "key size range {}..={}",
                config.min_key_size, config.max_key_size
            )));
        }
        if config.fixed_passkey.map_or(false, |passkey| passkey > SMP_PASSKEY_MAX) {
            return Err(SmpError::InvalidParameter("fixed passkey above 999999".into()));
        }
        if config.accepted_methods.is_empty() {
            return Err(SmpError::InvalidParameter("no accepted pairing method".into()));
        }

        debug!(
            "SMP configured: {} auth 0x{:02x} keys {}..={}",
            config.io_capability,
            config.auth_req.to_u8(),
            config.min_key_size,
            config.max_key_size
        );
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Subscribe to events
    pub fn register_handler(&mut self, handler: impl SmpEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn store(&self) -> &BondingStore<S> {
        &self.store
    }

    // Connections

    /// Register a new link and resolve the peer against the bonds
    pub fn connection_established(
        &mut self,
        handle: ConnectionHandle,
        role: PairingRole,
        local: LeAddress,
        peer: LeAddress,
    ) {
        if self.connections.contains_key(&handle) {
            warn!("Connection 0x{:04x} registered twice, dropping old state", handle);
            self.on_disconnect(handle);
        }

        let identity = if peer.is_resolvable_private() {
            self.store.resolve_address(&peer.address)
        } else {
            self.store.lookup_by_identity(&peer)
        };

        info!(
            "SMP: connection 0x{:04x} to {} as {}",
            handle, peer, role
        );
        self.connections.insert(
            handle,
            SmConnection {
                role,
                local,
                peer,
                identity,
                security: SecurityLevel::None,
                key_size: 0,
                pairing: None,
                assembler: PduAssembler::new(),
            },
        );

        let event = match identity.and_then(|slot| self.store.get(slot).map(|entry| (slot, entry.address))) {
            Some((slot, identity)) => {
                debug!("Peer {} resolved to bond {} ({})", peer, slot, identity);
                IdentityEvent::Resolved {
                    handle,
                    peer,
                    identity,
                    slot,
                }
            }
            None => IdentityEvent::NotFound { handle, peer },
        };
        self.notify_event(SmpEvent::Identity(event));
    }

    /// Forget a link. A pairing attempt in progress fails as disconnected.
    pub fn on_disconnect(&mut self, handle: ConnectionHandle) {
        let has_pairing = match self.connections.get(&handle) {
            Some(conn) => conn.pairing.is_some(),
            None => {
                warn!("Disconnect for unknown connection 0x{:04x}", handle);
                return;
            }
        };

        if has_pairing {
            self.drive(handle, Instant::now(), |ctx, env| {
                ctx.disconnected(env);
                Ok(())
            })
            .ok();
        }

        self.encryption.disconnected(handle);
        self.crypto.release(handle);
        self.connections.remove(&handle);
        debug!("SMP: connection 0x{:04x} removed", handle);
    }

    pub fn security_level(&self, handle: ConnectionHandle) -> SmpResult<SecurityLevel> {
        self.connection(handle).map(|conn| conn.security)
    }

    /// Negotiated key size of the current encryption, 0 if unencrypted
    pub fn key_size(&self, handle: ConnectionHandle) -> SmpResult<u8> {
        self.connection(handle).map(|conn| conn.key_size)
    }

    /// Bond the peer on this connection resolved to
    pub fn peer_identity(&self, handle: ConnectionHandle) -> SmpResult<Option<SlotIndex>> {
        self.connection(handle).map(|conn| conn.identity)
    }

    pub fn is_pairing(&self, handle: ConnectionHandle) -> bool {
        self.connections
            .get(&handle)
            .map_or(false, |conn| conn.pairing.is_some())
    }

    fn connection(&self, handle: ConnectionHandle) -> SmpResult<&SmConnection> {
        self.connections
            .get(&handle)
            .ok_or(SmpError::ConnectionNotFound(handle))
    }

    // Local requests

    /// Central: pair with the peer, or re-encrypt if it is already bonded
    pub fn request_pairing(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        let conn = self.connection(handle)?;
        if conn.role != PairingRole::Initiator {
            return Err(SmpError::WrongRole(PairingRole::Initiator));
        }
        if conn.pairing.is_some() || self.encryption.pending(handle).is_some() {
            return Err(SmpError::PairingInProgress(handle));
        }

        let encrypted = conn.security.is_encrypted();
        let bonded = conn
            .identity
            .filter(|&slot| self.store.get(slot).map_or(false, |entry| entry.ltk.is_some()));
        match bonded {
            Some(slot) if !encrypted => self.reencrypt(handle, slot),
            _ => self.start_pairing(handle),
        }
    }

    /// Peripheral: ask the central to secure the link
    pub fn send_security_request(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        let conn = self.connection(handle)?;
        if conn.role != PairingRole::Responder {
            return Err(SmpError::WrongRole(PairingRole::Responder));
        }
        if conn.pairing.is_some() {
            return Err(SmpError::PairingInProgress(handle));
        }

        let auth_req = self.config.auth_req.to_u8();
        info!(
            "SMP: sending Security Request on 0x{:04x} (auth 0x{:02x})",
            handle, auth_req
        );
        self.send_smp_packet(handle, &SmpPdu::SecurityRequest { auth_req })?;
        Ok(())
    }

    fn start_pairing(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        let now = Instant::now();
        let conn = self
            .connections
            .get_mut(&handle)
            .ok_or(SmpError::ConnectionNotFound(handle))?;
        self.attempts = self.attempts.wrapping_add(1);
        let peer = conn.peer;
        conn.pairing = Some(PairingContext::new_initiator(
            handle,
            self.attempts,
            self.config.clone(),
            conn.local,
            conn.peer,
            now,
        )
        .with_local_oob(self.local_oob));

        self.notify_event(SmpEvent::Pairing(PairingEvent::Started { handle, peer }));
        self.drive(handle, now, |ctx, env| ctx.start(env))
    }

    fn reencrypt(&mut self, handle: ConnectionHandle, slot: SlotIndex) -> SmpResult<()> {
        let ltk = self
            .store
            .get(slot)
            .and_then(|entry| entry.ltk)
            .ok_or(SmpError::Store(StoreError::InvalidSlot(slot)))?;
        let peer = self.connection(handle)?.peer;

        info!("SMP: re-encrypting 0x{:04x} with bond {}", handle, slot);
        self.encryption
            .start(handle, &ltk, EncryptionPurpose::Reencryption(slot))?;
        self.notify_event(SmpEvent::Pairing(PairingEvent::ReencryptionStarted {
            handle,
            peer,
        }));
        Ok(())
    }

    // User responses

    pub fn just_works_confirm(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        self.drive(handle, Instant::now(), |ctx, env| {
            ctx.confirm(env, UserWait::JustWorksConfirm)
        })
    }

    pub fn numeric_comparison_confirm(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        self.drive(handle, Instant::now(), |ctx, env| {
            ctx.confirm(env, UserWait::NumericComparisonConfirm)
        })
    }

    pub fn passkey_input(&mut self, handle: ConnectionHandle, passkey: u32) -> SmpResult<()> {
        self.drive(handle, Instant::now(), |ctx, env| ctx.passkey_input(env, passkey))
    }

    /// Refuse the pending user request and end the attempt
    pub fn bonding_decline(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        self.drive(handle, Instant::now(), |ctx, env| ctx.decline(env))
    }

    pub fn keypress_notification(
        &mut self,
        handle: ConnectionHandle,
        notification: KeypressNotificationType,
    ) -> SmpResult<()> {
        self.drive(handle, Instant::now(), |ctx, env| {
            ctx.keypress(env, notification)
        })
    }

    pub fn authorization_grant(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        self.set_authorization(handle, true)
    }

    pub fn authorization_decline(&mut self, handle: ConnectionHandle) -> SmpResult<()> {
        self.set_authorization(handle, false)
    }

    fn set_authorization(&mut self, handle: ConnectionHandle, granted: bool) -> SmpResult<()> {
        let slot = self.connection(handle)?.identity.ok_or(SmpError::InvalidState)?;
        let mut entry = self
            .store
            .get(slot)
            .cloned()
            .ok_or(StoreError::InvalidSlot(slot))?;

        if entry.authorized != granted {
            entry.authorized = granted;
            self.store.update(slot, entry)?;
        }
        self.notify_event(SmpEvent::Pairing(PairingEvent::Authorization {
            handle,
            granted,
        }));
        Ok(())
    }

    // Transport input

    /// Handle one complete SMP PDU received on the fixed channel
    pub fn handle_smp_packet(&mut self, handle: ConnectionHandle, data: &[u8]) -> SmpResult<()> {
        trace!("SMP 0x{:04x} RX {}", handle, hex::encode(data));
        if !self.connections.contains_key(&handle) {
            warn!("Dropping SMP PDU for unknown connection 0x{:04x}", handle);
            return Err(SmpError::ConnectionNotFound(handle));
        }

        match SmpPdu::decode(data) {
            Ok(pdu) => self.handle_pdu(handle, pdu),
            Err(e) => {
                self.handle_decode_error(handle, e);
                Err(e.into())
            }
        }
    }

    /// Handle SMP bytes from a transport that does not preserve PDU
    /// boundaries. Partial frames are kept until the next call.
    pub fn handle_smp_stream(&mut self, handle: ConnectionHandle, data: &[u8]) -> SmpResult<()> {
        for &byte in data {
            let frame = match self.connections.get_mut(&handle) {
                Some(conn) => conn.assembler.push(byte),
                None => {
                    warn!("Dropping SMP bytes for unknown connection 0x{:04x}", handle);
                    return Err(SmpError::ConnectionNotFound(handle));
                }
            };

            match frame {
                Some(Ok(pdu)) => self.handle_pdu(handle, pdu)?,
                Some(Err(e)) => {
                    self.handle_decode_error(handle, e);
                    return Err(e.into());
                }
                None => {}
            }
        }
        Ok(())
    }

    fn handle_decode_error(&mut self, handle: ConnectionHandle, error: DecodeError) {
        warn!("SMP 0x{:04x}: {}", handle, error);
        let reason = match error {
            DecodeError::UnknownOpcode(_) => FailureReason::CommandNotSupported,
            _ => FailureReason::InvalidParameters,
        };

        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.assembler.reset();
        }

        if self.is_pairing(handle) {
            self.drive(handle, Instant::now(), |ctx, env| {
                ctx.abort(env, PairingFailure::Local(reason));
                Ok(())
            })
            .ok();
        } else if reason == FailureReason::CommandNotSupported {
            self.send_pairing_failed(handle, reason);
        }
    }

    fn handle_pdu(&mut self, handle: ConnectionHandle, pdu: SmpPdu) -> SmpResult<()> {
        let now = Instant::now();
        let conn = self.connection(handle)?;
        let role = conn.role;
        if conn.pairing.is_some() {
            return self.drive(handle, now, |ctx, env| {
                ctx.handle_pdu(env, pdu);
                Ok(())
            });
        }

        match (pdu, role) {
            (pdu @ SmpPdu::PairingRequest(_), PairingRole::Responder) => {
                self.handle_pairing_request(handle, pdu, now)
            }
            (SmpPdu::SecurityRequest { auth_req }, PairingRole::Initiator) => {
                self.handle_security_request(handle, AuthRequirements::from_u8(auth_req))
            }
            (SmpPdu::PairingRequest(_), PairingRole::Initiator) => {
                warn!("SMP 0x{:04x}: Pairing Request sent to the central", handle);
                self.send_pairing_failed(handle, FailureReason::CommandNotSupported);
                Ok(())
            }
            (SmpPdu::PairingFailed(reason), _) => {
                debug!(
                    "SMP 0x{:04x}: ignoring Pairing Failed ({}) outside pairing",
                    handle, reason
                );
                Ok(())
            }
            (pdu, role) => {
                warn!(
                    "SMP 0x{:04x}: dropping opcode 0x{:02x} outside pairing ({})",
                    handle,
                    pdu.opcode(),
                    role
                );
                Ok(())
            }
        }
    }

    fn handle_pairing_request(
        &mut self,
        handle: ConnectionHandle,
        pdu: SmpPdu,
        now: Instant,
    ) -> SmpResult<()> {
        let conn = self
            .connections
            .get_mut(&handle)
            .ok_or(SmpError::ConnectionNotFound(handle))?;
        self.attempts = self.attempts.wrapping_add(1);
        let peer = conn.peer;
        conn.pairing = Some(PairingContext::new_responder(
            handle,
            self.attempts,
            self.config.clone(),
            conn.local,
            conn.peer,
            now,
        )
        .with_local_oob(self.local_oob));

        info!("SMP: pairing requested by {} on 0x{:04x}", peer, handle);
        self.notify_event(SmpEvent::Pairing(PairingEvent::Started { handle, peer }));
        self.drive(handle, now, |ctx, env| {
            ctx.handle_pdu(env, pdu);
            Ok(())
        })
    }

    fn handle_security_request(
        &mut self,
        handle: ConnectionHandle,
        auth: AuthRequirements,
    ) -> SmpResult<()> {
        if self.encryption.pending(handle).is_some() {
            debug!("SMP 0x{:04x}: Security Request while encrypting, ignored", handle);
            return Ok(());
        }

        let conn = self.connection(handle)?;
        let encrypted = conn.security.is_encrypted();
        let bond = conn
            .identity
            .and_then(|slot| self.store.get(slot).map(|entry| (slot, entry)))
            .filter(|(_, entry)| entry.ltk.is_some())
            .map(|(slot, entry)| (slot, entry.authenticated));

        if let Some((slot, authenticated)) = bond {
            if !auth.mitm || authenticated {
                if encrypted {
                    debug!("SMP 0x{:04x}: link already meets Security Request", handle);
                    return Ok(());
                }
                return self.reencrypt(handle, slot);
            }
            debug!(
                "SMP 0x{:04x}: bond {} is unauthenticated, pairing again",
                handle, slot
            );
        }

        self.start_pairing(handle)
    }

    // Link layer and crypto input

    /// Peripheral: the controller asks for the key to encrypt the link with
    pub fn on_ltk_request(
        &mut self,
        handle: ConnectionHandle,
        ediv: u16,
        rand: [u8; 8],
    ) -> SmpResult<()> {
        let conn = match self.connections.get(&handle) {
            Some(conn) => conn,
            None => {
                warn!("LTK request for unknown connection 0x{:04x}", handle);
                self.encryption.link_mut().ltk_negative_reply(handle)?;
                return Err(SmpError::ConnectionNotFound(handle));
            }
        };
        let pairing_key = conn.pairing.as_ref().and_then(|ctx| ctx.encryption_key());
        let identity = conn.identity;
        let peer = conn.peer;

        let answer = self.encryption.answer_ltk_request(
            handle,
            ediv,
            &rand,
            pairing_key,
            identity,
            &self.store,
        )?;
        if let LtkAnswer::Bond(_) = answer {
            self.notify_event(SmpEvent::Pairing(PairingEvent::ReencryptionStarted {
                handle,
                peer,
            }));
        }
        Ok(())
    }

    /// Encryption Change or Encryption Key Refresh Complete from the controller
    pub fn on_encryption_change(&mut self, handle: ConnectionHandle, status: u8, enabled: bool) {
        let peer = match self.connections.get(&handle) {
            Some(conn) => conn.peer,
            None => {
                warn!("Encryption change for unknown connection 0x{:04x}", handle);
                return;
            }
        };

        match self
            .encryption
            .encryption_changed(handle, status, enabled, &self.store)
        {
            EncryptionChange::Pairing { status } => {
                if let Some(conn) = self.connections.get_mut(&handle) {
                    if status == 0 {
                        conn.security = conn.security.max(SecurityLevel::EncryptionOnly);
                    }
                }
                if self.is_pairing(handle) {
                    self.drive(handle, Instant::now(), |ctx, env| {
                        ctx.encryption_changed(env, status);
                        Ok(())
                    })
                    .ok();
                }
            }
            EncryptionChange::Reencryption { slot, result } => {
                if let (Ok(level), Some(conn)) = (result, self.connections.get_mut(&handle)) {
                    conn.security = level;
                    conn.identity = Some(slot);
                    conn.key_size = self.store.get(slot).map_or(0, |entry| entry.key_size);
                }
                self.notify_event(SmpEvent::Pairing(PairingEvent::ReencryptionComplete {
                    handle,
                    peer,
                    result: result.map_err(PairingFailure::Encryption),
                }));
            }
            EncryptionChange::Unsolicited { status, enabled } => {
                debug!(
                    "SMP 0x{:04x}: unsolicited encryption change (status 0x{:02x}, enabled {})",
                    handle, status, enabled
                );
                if !enabled {
                    if let Some(conn) = self.connections.get_mut(&handle) {
                        conn.security = SecurityLevel::None;
                        conn.key_size = 0;
                    }
                }
            }
        }
    }

    /// Deliver a crypto response that the provider completed asynchronously
    pub fn crypto_complete(&mut self, token: CryptoToken, response: CryptoResponse) {
        let current = self
            .connections
            .get(&token.handle)
            .and_then(|conn| conn.pairing.as_ref())
            .map_or(false, |ctx| ctx.attempt() == token.attempt);
        if !current {
            warn!(
                "Discarding crypto completion for 0x{:04x} attempt {}: no such attempt",
                token.handle, token.attempt
            );
            return;
        }

        self.drive(token.handle, Instant::now(), |ctx, env| {
            ctx.crypto_complete(env, token, response);
            Ok(())
        })
        .ok();
    }

    /// Fail every attempt whose timer has expired at `now`
    pub fn process_timeouts(&mut self, now: Instant) {
        let expired: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.pairing.as_ref().map_or(false, |ctx| now >= ctx.deadline()))
            .map(|(&handle, _)| handle)
            .collect();

        for handle in expired {
            warn!("SMP 0x{:04x}: pairing timed out", handle);
            self.drive(handle, now, |ctx, env| {
                ctx.poll_timeout(env);
                Ok(())
            })
            .ok();
        }
    }

    /// Earliest pairing timer, for scheduling the next `process_timeouts`
    pub fn next_timeout(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|conn| conn.pairing.as_ref().map(|ctx| ctx.deadline()))
            .min()
    }

    // Bond management

    /// Copy of every stored bond
    pub fn bonds(&self) -> Vec<(SlotIndex, BondingEntry)> {
        self.store.dump()
    }

    pub fn remove_bond(&mut self, slot: SlotIndex) -> SmpResult<BondingEntry> {
        let entry = self.store.remove(slot)?;
        for conn in self.connections.values_mut() {
            if conn.identity == Some(slot) {
                conn.identity = None;
            }
        }
        Ok(entry)
    }

    /// Bond whose IRK generated this resolvable private address
    pub fn resolve_address(&self, address: &BdAddr) -> Option<SlotIndex> {
        self.store.resolve_address(address)
    }

    /// Fresh resolvable private address for the local identity
    pub fn generate_private_address(&mut self) -> SmpResult<BdAddr> {
        let irk = self
            .config
            .identity
            .as_ref()
            .map(|identity| identity.irk)
            .ok_or(SmpError::InvalidState)?;
        let mut prand = [0u8; 3];
        self.crypto.random_bytes(&mut prand);
        Ok(crypto::private_address_from_prand(&irk, prand))
    }

    /// Generate local Secure Connections OOB data for the peer
    ///
    /// Later OOB attempts use the key pair and random behind the returned
    /// confirm value, until this is called again.
    pub fn generate_sc_oob_data(&mut self) -> SmpResult<ScOobData> {
        let public_key = self
            .crypto
            .generate_oob_key_pair()
            .ok_or(SmpError::InvalidState)?;
        let random = self.crypto.random_u128();
        let confirm = crypto::f4(&public_key.x, &public_key.x, random, 0);
        self.local_oob = Some(random);

        debug!("SMP: generated Secure Connections OOB data");
        trace!(
            "SMP OOB confirm {} random {}",
            hex::encode(confirm.to_le_bytes()),
            hex::encode(random.to_le_bytes())
        );
        Ok(ScOobData {
            confirm: confirm.to_le_bytes(),
            random: random.to_le_bytes(),
        })
    }

    // Data signing

    /// Sign outgoing data with the local CSRK of the peer's bond
    ///
    /// Returns `SignCounter || MAC` and advances the stored counter.
    pub fn sign_data(
        &mut self,
        handle: ConnectionHandle,
        message: &[u8],
    ) -> SmpResult<[u8; SMP_SIGNATURE_SIZE]> {
        let slot = self.connection(handle)?.identity.ok_or(SmpError::InvalidState)?;
        let mut entry = self
            .store
            .get(slot)
            .cloned()
            .ok_or(StoreError::InvalidSlot(slot))?;
        let csrk = entry
            .local_csrk
            .as_mut()
            .ok_or(SmpError::NoSigningKey(handle))?;

        let counter = csrk.counter;
        let mac = crypto::sign_data(&csrk.key, message, counter);
        csrk.increment_counter();
        self.store.update(slot, entry)?;

        let mut signature = [0u8; SMP_SIGNATURE_SIZE];
        LittleEndian::write_u32(&mut signature[..4], counter);
        signature[4..].copy_from_slice(&mac);
        trace!("SMP 0x{:04x}: signed {} bytes with counter {}", handle, message.len(), counter);
        Ok(signature)
    }

    /// Check signed data from the peer against its CSRK
    ///
    /// A counter below the last accepted one is a replay. On success the
    /// stored counter moves past the received one.
    pub fn verify_signed_data(
        &mut self,
        handle: ConnectionHandle,
        message: &[u8],
        signature: &[u8; SMP_SIGNATURE_SIZE],
    ) -> SmpResult<()> {
        let slot = self.connection(handle)?.identity.ok_or(SmpError::InvalidState)?;
        let mut entry = self
            .store
            .get(slot)
            .cloned()
            .ok_or(StoreError::InvalidSlot(slot))?;
        let csrk = entry
            .remote_csrk
            .as_mut()
            .ok_or(SmpError::NoSigningKey(handle))?;

        let counter = LittleEndian::read_u32(&signature[..4]);
        if counter < csrk.counter {
            warn!(
                "SMP 0x{:04x}: signed data replayed (counter {}, expected at least {})",
                handle, counter, csrk.counter
            );
            return Err(SmpError::InvalidSignature(handle));
        }
        if crypto::sign_data(&csrk.key, message, counter)[..] != signature[4..] {
            warn!("SMP 0x{:04x}: invalid signature on signed data", handle);
            return Err(SmpError::InvalidSignature(handle));
        }

        csrk.counter = counter;
        csrk.increment_counter();
        self.store.update(slot, entry)?;
        Ok(())
    }

    // Internals

    /// Run one input through the connection's pairing context, then carry
    /// out the actions it produced
    fn drive<F>(&mut self, handle: ConnectionHandle, now: Instant, f: F) -> SmpResult<()>
    where
        F: FnOnce(&mut PairingContext, &mut PairingEnv<'_>) -> SmpResult<()>,
    {
        let mut actions = Vec::new();
        let result = {
            let ctx = self
                .connections
                .get_mut(&handle)
                .ok_or(SmpError::ConnectionNotFound(handle))?
                .pairing
                .as_mut()
                .ok_or(SmpError::NoPairingInProgress(handle))?;
            let mut env = PairingEnv {
                crypto: &mut *self.crypto,
                actions: &mut actions,
                now,
            };
            f(ctx, &mut env)
        };

        self.run_actions(handle, actions);
        result
    }

    fn run_actions(&mut self, handle: ConnectionHandle, actions: Vec<PairingAction>) {
        for action in actions {
            match action {
                PairingAction::Send(pdu) => {
                    if let Err(e) = self.send_smp_packet(handle, &pdu) {
                        error!("SMP 0x{:04x}: {}", handle, e);
                    }
                }
                PairingAction::StartEncryption(ltk) => {
                    if self
                        .encryption
                        .start(handle, &ltk, EncryptionPurpose::Pairing)
                        .is_err()
                    {
                        self.drive(handle, Instant::now(), |ctx, env| {
                            ctx.abort(env, PairingFailure::Local(FailureReason::UnspecifiedReason));
                            Ok(())
                        })
                        .ok();
                    }
                }
                PairingAction::User(request) => {
                    if let Some(peer) = self.connections.get(&handle).map(|conn| conn.peer) {
                        debug!("SMP 0x{:04x}: user request {:?}", handle, request);
                        self.notify_event(SmpEvent::UserRequest {
                            handle,
                            peer,
                            request,
                        });
                    }
                }
                PairingAction::Keypress(notification) => {
                    self.notify_event(SmpEvent::Pairing(PairingEvent::Keypress {
                        handle,
                        notification,
                    }));
                }
                PairingAction::Finished(result) => self.finish_pairing(handle, result),
            }
        }
    }

    /// Destroy the pairing context and report the outcome
    fn finish_pairing(
        &mut self,
        handle: ConnectionHandle,
        result: Result<PairingResult, PairingFailure>,
    ) {
        let peer = match self.connections.get_mut(&handle) {
            Some(conn) => {
                conn.pairing = None;
                conn.peer
            }
            None => return,
        };
        self.crypto.release(handle);

        let result = match result {
            Ok(result) => self.complete_pairing(handle, result),
            Err(failure) => Err(failure),
        };
        self.notify_event(SmpEvent::Pairing(PairingEvent::Complete {
            handle,
            peer,
            result,
        }));
    }

    fn complete_pairing(
        &mut self,
        handle: ConnectionHandle,
        result: PairingResult,
    ) -> Result<PairingSummary, PairingFailure> {
        let PairingResult {
            mut summary,
            bond,
            peer_identity,
        } = result;

        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.security = summary.security_level;
            conn.key_size = summary.key_size;
        }
        if let Some(identity) = peer_identity {
            debug!("SMP 0x{:04x}: peer identity {}", handle, identity);
        }

        let entry = match bond {
            Some(entry) => entry,
            None => return Ok(summary),
        };
        let identity = entry.address;
        let slot = self.store_bond(entry).map_err(|e| {
            error!("SMP 0x{:04x}: failed to store bond: {}", handle, e);
            PairingFailure::Bonding(e)
        })?;

        summary.bonded_slot = Some(slot);
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.identity = Some(slot);
        }
        self.notify_event(SmpEvent::Identity(IdentityEvent::Created {
            handle,
            identity,
            slot,
        }));
        Ok(summary)
    }

    /// Locate the bond by IRK and identity address, then by identity
    /// address alone, otherwise add a new one
    fn store_bond(&mut self, entry: BondingEntry) -> Result<SlotIndex, StoreError> {
        let by_irk = entry.irk.and_then(|irk| {
            self.store
                .entries()
                .find(|(_, existing)| existing.irk == Some(irk) && existing.address == entry.address)
                .map(|(slot, _)| slot)
        });

        match by_irk.or_else(|| self.store.lookup_by_identity(&entry.address)) {
            Some(slot) => {
                if self.store.get(slot).map_or(false, |existing| existing.irk != entry.irk) {
                    info!("Replacing bond {} of {} with new keys", slot, entry.address);
                }
                self.store.update(slot, entry)?;
                Ok(slot)
            }
            None => self.store.add(entry),
        }
    }

    fn send_smp_packet(&mut self, handle: ConnectionHandle, pdu: &SmpPdu) -> SmpResult<()> {
        let data = pdu.encode();
        trace!("SMP 0x{:04x} TX {}", handle, hex::encode(&data));
        self.transport.send_pdu(handle, &data)?;
        Ok(())
    }

    fn send_pairing_failed(&mut self, handle: ConnectionHandle, reason: FailureReason) {
        if let Err(e) = self.send_smp_packet(handle, &SmpPdu::PairingFailed(reason)) {
            error!("SMP 0x{:04x}: {}", handle, e);
        }
    }

    fn notify_event(&mut self, event: SmpEvent) {
        for handler in self.handlers.iter_mut() {
            match &event {
                SmpEvent::UserRequest {
                    handle,
                    peer,
                    request,
                } => handler.user_request(*handle, peer, request),
                SmpEvent::Pairing(event) => handler.pairing(event),
                SmpEvent::Identity(event) => handler.identity(event),
            }
        }
    }
}
