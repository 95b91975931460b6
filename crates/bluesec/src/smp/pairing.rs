//! Pairing implementation for the Security Manager Protocol
//!
//! This module holds the per-connection pairing state machine for both LE
//! Legacy Pairing and LE Secure Connections. A [`PairingContext`] never talks
//! to the transport, the controller or the application directly: every input
//! produces a list of [`PairingAction`]s that the manager carries out.

use super::constants::*;
use super::crypto::{self, CryptoProvider, CryptoRequest, CryptoResponse, CryptoToken};
use super::crypto::{DhKey, IoCap, PublicKey};
use super::keys::{BondingEntry, DistributedKeys, LongTermKey, SigningKey};
use super::pdu::{InvalidField, PairingParameters, SmpPdu};
use super::types::*;
use crate::gap::LeAddress;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::time::Instant;

/// Association model picked from the IO capability tables. Passkey Entry is
/// split by which side types the passkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationModel {
    JustWorks,
    /// Initiator inputs, responder displays
    PasskeyInitiatorInputs,
    /// Responder inputs, initiator displays
    PasskeyResponderInputs,
    /// Both sides input
    PasskeyBothInput,
    NumericComparison,
    OutOfBand,
}

impl AssociationModel {
    pub fn method(&self) -> PairingMethod {
        match self {
            AssociationModel::JustWorks => PairingMethod::JustWorks,
            AssociationModel::PasskeyInitiatorInputs
            | AssociationModel::PasskeyResponderInputs
            | AssociationModel::PasskeyBothInput => PairingMethod::PasskeyEntry,
            AssociationModel::NumericComparison => PairingMethod::NumericComparison,
            AssociationModel::OutOfBand => PairingMethod::OutOfBand,
        }
    }

    /// Whether the side with `role` types the passkey
    pub fn inputs_passkey(&self, role: PairingRole) -> bool {
        matches!(
            (self, role),
            (AssociationModel::PasskeyBothInput, _)
                | (AssociationModel::PasskeyInitiatorInputs, PairingRole::Initiator)
                | (AssociationModel::PasskeyResponderInputs, PairingRole::Responder)
        )
    }
}

use AssociationModel::{
    JustWorks as JW, NumericComparison as NC, PasskeyBothInput as PK_BOTH,
    PasskeyInitiatorInputs as PK_INIT, PasskeyResponderInputs as PK_RESP,
};

/// LE Legacy Pairing method table, indexed `[responder IO][initiator IO]`
const LEGACY_METHOD_TABLE: [[AssociationModel; 5]; 5] = [
    [JW, JW, PK_INIT, JW, PK_INIT],
    [JW, JW, PK_INIT, JW, PK_INIT],
    [PK_RESP, PK_RESP, PK_BOTH, JW, PK_RESP],
    [JW, JW, JW, JW, JW],
    [PK_RESP, PK_RESP, PK_INIT, JW, PK_RESP],
];

/// LE Secure Connections method table, indexed `[responder IO][initiator IO]`
const SC_METHOD_TABLE: [[AssociationModel; 5]; 5] = [
    [JW, JW, PK_INIT, JW, PK_INIT],
    [JW, NC, PK_INIT, JW, NC],
    [PK_RESP, PK_RESP, PK_BOTH, JW, PK_RESP],
    [JW, JW, JW, JW, JW],
    [PK_RESP, NC, PK_INIT, JW, NC],
];

/// Pick the protocol family and association model from the exchanged
/// Pairing Request and Pairing Response. Returns `(secure_connections, model)`.
pub fn select_method(
    preq: &PairingParameters,
    pres: &PairingParameters,
) -> (bool, AssociationModel) {
    let secure_connections = preq.auth().secure_connections && pres.auth().secure_connections;

    let oob = if secure_connections {
        preq.oob_present() || pres.oob_present()
    } else {
        preq.oob_present() && pres.oob_present()
    };
    if oob {
        return (secure_connections, AssociationModel::OutOfBand);
    }

    if !preq.auth().mitm && !pres.auth().mitm {
        return (secure_connections, AssociationModel::JustWorks);
    }

    let initiator_io = usize::from(preq.io_capability);
    let responder_io = usize::from(pres.io_capability);
    if initiator_io > 4 || responder_io > 4 {
        return (secure_connections, AssociationModel::JustWorks);
    }

    let table = if secure_connections {
        &SC_METHOD_TABLE
    } else {
        &LEGACY_METHOD_TABLE
    };
    (secure_connections, table[responder_io][initiator_io])
}

/// User interaction the state machine is suspended on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserWait {
    PasskeyInput,
    NumericComparisonConfirm,
    JustWorksConfirm,
}

/// Pairing state machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Context created, nothing sent
    Idle,
    /// Initiator waiting for the Pairing Response
    FeatureExchange,
    /// Secure Connections public key exchange and DHKey computation
    PublicKeyExchange,
    /// Legacy confirm value exchange
    LegacyConfirm,
    /// Legacy random value exchange
    LegacyRandom,
    /// Secure Connections confirm value exchange
    ScConfirm,
    /// Secure Connections nonce exchange
    ScRandom,
    /// Secure Connections DHKey check exchange
    DhKeyCheck,
    /// Suspended until the application answers
    WaitForUserResponse(UserWait),
    /// Waiting for the link to be encrypted with the STK/LTK
    WaitForEncryption,
    /// Exchanging transport specific keys
    KeyDistribution,
    /// Pairing complete
    Complete,
    /// Pairing failed
    Failed,
}

/// Successful outcome of a pairing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResult {
    pub summary: PairingSummary,
    /// Entry to persist, when both sides requested bonding
    pub bond: Option<BondingEntry>,
    /// Identity address distributed by the peer
    pub peer_identity: Option<LeAddress>,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingAction {
    Send(SmpPdu),
    /// Initiator only: encrypt the link with this key
    StartEncryption(LongTermKey),
    User(UserRequest),
    /// Keypress notification received from the peer
    Keypress(KeypressNotificationType),
    Finished(Result<PairingResult, PairingFailure>),
}

/// Collaborators handed to the state machine for the duration of one input
pub struct PairingEnv<'a> {
    pub crypto: &'a mut dyn CryptoProvider,
    pub actions: &'a mut Vec<PairingAction>,
    pub now: Instant,
}

impl PairingEnv<'_> {
    fn send(&mut self, pdu: SmpPdu) {
        self.actions.push(PairingAction::Send(pdu));
    }

    fn user(&mut self, request: UserRequest) {
        self.actions.push(PairingAction::User(request));
    }
}

/// Key sets both sides ask for: identity always, encryption and signing keys
/// only when bonding
fn requested_keys(auth: &AuthRequirements) -> KeyDistribution {
    if auth.bonding {
        KeyDistribution::ID_KEY | KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY
    } else {
        KeyDistribution::ID_KEY
    }
}

/// Key sets this device is able to distribute
fn offered_keys(config: &SecurityConfig) -> KeyDistribution {
    let mut keys = KeyDistribution::ENC_KEY;
    if config.identity.is_some() {
        keys |= KeyDistribution::ID_KEY;
    }
    if config.csrk.is_some() {
        keys |= KeyDistribution::SIGN_KEY;
    }
    keys
}

/// Zero the key octets above the negotiated key size
fn truncate_key(key: u128, key_size: u8) -> u128 {
    if key_size >= 16 {
        key
    } else {
        key & ((1u128 << (u32::from(key_size) * 8)) - 1)
    }
}

/// Per-connection pairing state
pub struct PairingContext {
    handle: ConnectionHandle,
    attempt: u32,
    role: PairingRole,
    config: SecurityConfig,
    local_address: LeAddress,
    peer_address: LeAddress,
    state: PairingState,
    deadline: Instant,

    preq: Option<PairingParameters>,
    pres: Option<PairingParameters>,
    secure_connections: bool,
    model: AssociationModel,
    key_size: u8,

    tk: u128,
    passkey: Option<u32>,
    passkey_round: u8,
    local_nonce: u128,
    peer_nonce: u128,
    local_confirm: Option<u128>,
    peer_confirm: Option<u128>,

    local_public_key: Option<PublicKey>,
    peer_public_key: Option<PublicKey>,
    dh_key: Option<DhKey>,
    mac_key: u128,
    /// STK for Legacy pairing, LTK for Secure Connections
    session_key: u128,
    peer_dhkey_check: Option<u128>,
    /// r of the OOB data this device handed out, if any
    local_oob_random: Option<u128>,

    pending_crypto: Option<CryptoToken>,
    deferred: VecDeque<SmpPdu>,

    keys_to_send: KeyDistribution,
    keys_to_receive: KeyDistribution,
    expected_key_pdus: VecDeque<u8>,
    keys_sent: bool,
    local_keys: DistributedKeys,
    peer_keys: DistributedKeys,
}

impl PairingContext {
    fn new(
        handle: ConnectionHandle,
        attempt: u32,
        role: PairingRole,
        config: SecurityConfig,
        local_address: LeAddress,
        peer_address: LeAddress,
        now: Instant,
    ) -> Self {
        let deadline = now + config.timeout;
        Self {
            handle,
            attempt,
            role,
            config,
            local_address,
            peer_address,
            state: PairingState::Idle,
            deadline,
            preq: None,
            pres: None,
            secure_connections: false,
            model: AssociationModel::JustWorks,
            key_size: 0,
            tk: 0,
            passkey: None,
            passkey_round: 0,
            local_nonce: 0,
            peer_nonce: 0,
            local_confirm: None,
            peer_confirm: None,
            local_public_key: None,
            peer_public_key: None,
            dh_key: None,
            mac_key: 0,
            session_key: 0,
            peer_dhkey_check: None,
            local_oob_random: None,
            pending_crypto: None,
            deferred: VecDeque::new(),
            keys_to_send: KeyDistribution::empty(),
            keys_to_receive: KeyDistribution::empty(),
            expected_key_pdus: VecDeque::new(),
            keys_sent: false,
            local_keys: DistributedKeys::default(),
            peer_keys: DistributedKeys::default(),
        }
    }

    /// Create a context for a locally initiated attempt. Call [`start`](Self::start) next.
    pub fn new_initiator(
        handle: ConnectionHandle,
        attempt: u32,
        config: SecurityConfig,
        local_address: LeAddress,
        peer_address: LeAddress,
        now: Instant,
    ) -> Self {
        Self::new(
            handle,
            attempt,
            PairingRole::Initiator,
            config,
            local_address,
            peer_address,
            now,
        )
    }

    /// Create a context for a peer initiated attempt. Feed it the Pairing Request.
    pub fn new_responder(
        handle: ConnectionHandle,
        attempt: u32,
        config: SecurityConfig,
        local_address: LeAddress,
        peer_address: LeAddress,
        now: Instant,
    ) -> Self {
        Self::new(
            handle,
            attempt,
            PairingRole::Responder,
            config,
            local_address,
            peer_address,
            now,
        )
    }

    /// Use the random of locally generated Secure Connections OOB data. An
    /// OOB attempt then takes the key pair that data was generated with.
    pub fn with_local_oob(mut self, random: Option<u128>) -> Self {
        self.local_oob_random = random;
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Selected method, once feature exchange is done
    pub fn method(&self) -> Option<PairingMethod> {
        self.pres.map(|_| self.model.method())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, PairingState::Complete | PairingState::Failed)
    }

    /// Key the responder hands to the controller while waiting for encryption
    pub fn encryption_key(&self) -> Option<[u8; 16]> {
        (self.state == PairingState::WaitForEncryption).then(|| self.session_key.to_le_bytes())
    }

    fn set_state(&mut self, state: PairingState) {
        if self.state != state {
            debug!(
                "SMP 0x{:04x}: {:?} -> {:?}",
                self.handle, self.state, state
            );
            self.state = state;
        }
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = now + self.config.timeout;
    }

    fn send(&mut self, env: &mut PairingEnv<'_>, pdu: SmpPdu) {
        trace!("SMP 0x{:04x} TX {:?}", self.handle, pdu);
        self.touch(env.now);
        env.send(pdu);
    }

    fn fail(&mut self, env: &mut PairingEnv<'_>, failure: PairingFailure) {
        if self.is_finished() {
            return;
        }

        if let PairingFailure::Local(reason) = &failure {
            env.send(SmpPdu::PairingFailed(*reason));
        }
        warn!("SMP 0x{:04x}: pairing failed: {}", self.handle, failure);
        self.set_state(PairingState::Failed);
        self.pending_crypto = None;
        self.deferred.clear();
        env.actions.push(PairingAction::Finished(Err(failure)));
    }

    fn fail_local(&mut self, env: &mut PairingEnv<'_>, reason: FailureReason) {
        self.fail(env, PairingFailure::Local(reason));
    }

    fn unexpected(&mut self, env: &mut PairingEnv<'_>, opcode: u8) {
        warn!(
            "SMP 0x{:04x}: unexpected opcode 0x{:02x} in state {:?}",
            self.handle, opcode, self.state
        );
        self.fail_local(env, FailureReason::UnspecifiedReason);
    }

    fn preq_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = SMP_PAIRING_REQUEST;
        if let Some(preq) = &self.preq {
            out[1..].copy_from_slice(&preq.to_bytes());
        }
        out
    }

    fn pres_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = SMP_PAIRING_RESPONSE;
        if let Some(pres) = &self.pres {
            out[1..].copy_from_slice(&pres.to_bytes());
        }
        out
    }

    fn initiator_address(&self) -> &LeAddress {
        match self.role {
            PairingRole::Initiator => &self.local_address,
            PairingRole::Responder => &self.peer_address,
        }
    }

    fn responder_address(&self) -> &LeAddress {
        match self.role {
            PairingRole::Initiator => &self.peer_address,
            PairingRole::Responder => &self.local_address,
        }
    }

    fn is_initiator(&self) -> bool {
        self.role == PairingRole::Initiator
    }

    fn local_oob_flag(&self) -> bool {
        match (&self.config.oob_data, self.config.auth_req.secure_connections) {
            (Some(OobData::Legacy { .. }), _) => true,
            (Some(OobData::SecureConnections { .. }), true) => true,
            _ => false,
        }
    }

    fn local_parameters(&self, initiator_keys: KeyDistribution, responder_keys: KeyDistribution) -> PairingParameters {
        PairingParameters::new(
            self.config.io_capability,
            self.local_oob_flag(),
            self.config.auth_req,
            self.config.max_key_size,
            initiator_keys,
            responder_keys,
        )
    }

    fn random_u128(&self, env: &mut PairingEnv<'_>) -> u128 {
        env.crypto.random_u128()
    }

    fn request_crypto(&mut self, env: &mut PairingEnv<'_>, request: CryptoRequest) {
        let token = CryptoToken {
            handle: self.handle,
            attempt: self.attempt,
        };
        match env.crypto.submit(token, request) {
            Some(response) => self.on_crypto_response(env, response),
            None => {
                trace!("SMP 0x{:04x}: crypto request pending", self.handle);
                self.pending_crypto = Some(token);
            }
        }
    }

    /// Deliver an asynchronous crypto response. Stale tokens are ignored.
    pub fn crypto_complete(
        &mut self,
        env: &mut PairingEnv<'_>,
        token: CryptoToken,
        response: CryptoResponse,
    ) {
        if self.pending_crypto != Some(token) {
            warn!(
                "SMP 0x{:04x}: discarding unexpected crypto completion {:?}",
                self.handle, token
            );
            return;
        }

        self.pending_crypto = None;
        self.on_crypto_response(env, response);

        while self.pending_crypto.is_none() && !self.is_finished() {
            match self.deferred.pop_front() {
                Some(pdu) => self.dispatch(env, pdu),
                None => break,
            }
        }
    }

    fn on_crypto_response(&mut self, env: &mut PairingEnv<'_>, response: CryptoResponse) {
        match (self.state, response) {
            (PairingState::PublicKeyExchange, CryptoResponse::KeyPair(public_key)) => {
                self.local_public_key = Some(public_key);
                if self.is_initiator() || self.peer_public_key.is_some() {
                    self.send_public_key(env, &public_key);
                }
                if let Some(peer) = self.peer_public_key {
                    self.request_crypto(env, CryptoRequest::ComputeDhKey(peer));
                }
            }
            (PairingState::PublicKeyExchange, CryptoResponse::DhKey(Some(dh_key))) => {
                trace!(
                    "SMP 0x{:04x}: DHKey {}",
                    self.handle,
                    hex::encode(dh_key.0)
                );
                self.dh_key = Some(dh_key);
                self.start_sc_authentication(env);
            }
            (PairingState::PublicKeyExchange, CryptoResponse::DhKey(None)) => {
                warn!("SMP 0x{:04x}: peer public key rejected", self.handle);
                self.fail_local(env, FailureReason::DhKeyCheckFailed);
            }
            (state, response) => {
                warn!(
                    "SMP 0x{:04x}: crypto response {:?} not expected in state {:?}",
                    self.handle, response, state
                );
            }
        }
    }

    fn send_public_key(&mut self, env: &mut PairingEnv<'_>, public_key: &PublicKey) {
        let (x, y) = public_key.to_le_bytes();
        self.send(env, SmpPdu::PairingPublicKey { x, y });
    }

    /// Initiator: send the Pairing Request
    pub fn start(&mut self, env: &mut PairingEnv<'_>) -> SmpResult<()> {
        if self.role != PairingRole::Initiator {
            return Err(SmpError::WrongRole(PairingRole::Initiator));
        }
        if self.state != PairingState::Idle {
            return Err(SmpError::PairingInProgress(self.handle));
        }

        let requested = requested_keys(&self.config.auth_req);
        let preq = self.local_parameters(requested & offered_keys(&self.config), requested);
        self.preq = Some(preq);
        info!(
            "SMP 0x{:04x}: starting pairing with {} ({}, auth 0x{:02x})",
            self.handle, self.peer_address, self.config.io_capability, preq.auth_req
        );
        self.send(env, SmpPdu::PairingRequest(preq));
        self.set_state(PairingState::FeatureExchange);
        Ok(())
    }

    /// Feed a PDU received from the peer
    pub fn handle_pdu(&mut self, env: &mut PairingEnv<'_>, pdu: SmpPdu) {
        if self.is_finished() {
            return;
        }
        trace!("SMP 0x{:04x} RX {:?}", self.handle, pdu);
        self.touch(env.now);

        if let SmpPdu::PairingFailed(reason) = pdu {
            self.fail(env, PairingFailure::Remote(reason));
            return;
        }

        if let Err(field) = pdu.validate() {
            warn!("SMP 0x{:04x}: {}", self.handle, field);
            let reason = match field {
                InvalidField::MaxKeySize(_) => FailureReason::EncryptionKeySize,
                _ => FailureReason::InvalidParameters,
            };
            self.fail_local(env, reason);
            return;
        }

        if self.pending_crypto.is_some() {
            self.deferred.push_back(pdu);
            return;
        }

        self.dispatch(env, pdu);
    }

    fn dispatch(&mut self, env: &mut PairingEnv<'_>, pdu: SmpPdu) {
        match pdu {
            SmpPdu::PairingRequest(params) => self.on_pairing_request(env, params),
            SmpPdu::PairingResponse(params) => self.on_pairing_response(env, params),
            SmpPdu::PairingConfirm(value) => {
                self.on_pairing_confirm(env, u128::from_le_bytes(value))
            }
            SmpPdu::PairingRandom(value) => self.on_pairing_random(env, u128::from_le_bytes(value)),
            SmpPdu::PairingPublicKey { x, y } => {
                self.on_public_key(env, PublicKey::from_le_bytes(&x, &y))
            }
            SmpPdu::PairingDhKeyCheck(value) => {
                self.on_dhkey_check(env, u128::from_le_bytes(value))
            }
            SmpPdu::KeypressNotification(kind) => {
                if let Some(kind) = KeypressNotificationType::from_u8(kind) {
                    env.actions.push(PairingAction::Keypress(kind));
                }
            }
            SmpPdu::SecurityRequest { .. } => {
                debug!(
                    "SMP 0x{:04x}: ignoring Security Request during pairing",
                    self.handle
                );
            }
            SmpPdu::PairingFailed(reason) => self.fail(env, PairingFailure::Remote(reason)),
            SmpPdu::EncryptionInformation(_)
            | SmpPdu::MasterIdentification { .. }
            | SmpPdu::IdentityInformation(_)
            | SmpPdu::IdentityAddressInformation { .. }
            | SmpPdu::SigningInformation(_) => self.on_key_pdu(env, pdu),
        }
    }

    /// Check policy once both Pairing Request and Response are known. Returns
    /// false if the attempt was failed.
    fn negotiate(&mut self, env: &mut PairingEnv<'_>) -> bool {
        let (preq, pres) = match (self.preq, self.pres) {
            (Some(preq), Some(pres)) => (preq, pres),
            _ => return false,
        };

        let (secure_connections, model) = select_method(&preq, &pres);
        self.secure_connections = secure_connections;
        self.model = model;
        self.key_size = preq.max_key_size.min(pres.max_key_size);

        debug!(
            "SMP 0x{:04x}: {} pairing, method {}, key size {}",
            self.handle,
            if secure_connections { "Secure Connections" } else { "Legacy" },
            model.method(),
            self.key_size
        );

        if self.config.secure_connections_only && !secure_connections {
            self.fail_local(env, FailureReason::AuthenticationRequirements);
            return false;
        }
        if self.config.auth_req.mitm && model == AssociationModel::JustWorks {
            self.fail_local(env, FailureReason::PairingNotSupported);
            return false;
        }
        if !self.config.accepted_methods.accepts(model.method()) {
            self.fail_local(env, FailureReason::AuthenticationRequirements);
            return false;
        }
        if self.key_size < self.config.min_key_size {
            self.fail_local(env, FailureReason::EncryptionKeySize);
            return false;
        }
        if model == AssociationModel::OutOfBand && !secure_connections {
            match &self.config.oob_data {
                Some(OobData::Legacy { tk }) => self.tk = u128::from_le_bytes(*tk),
                _ => {
                    self.fail_local(env, FailureReason::OobNotAvailable);
                    return false;
                }
            }
        }

        let mut strip = KeyDistribution::LINK_KEY;
        if secure_connections {
            strip |= KeyDistribution::ENC_KEY;
        }
        let initiator_keys = pres.initiator_keys() - strip;
        let responder_keys = pres.responder_keys() - strip;
        (self.keys_to_send, self.keys_to_receive) = match self.role {
            PairingRole::Initiator => (initiator_keys, responder_keys),
            PairingRole::Responder => (responder_keys, initiator_keys),
        };

        true
    }

    fn on_pairing_request(&mut self, env: &mut PairingEnv<'_>, preq: PairingParameters) {
        if self.role != PairingRole::Responder || self.state != PairingState::Idle {
            self.unexpected(env, SMP_PAIRING_REQUEST);
            return;
        }

        let requested = requested_keys(&self.config.auth_req);
        let pres = self.local_parameters(
            preq.initiator_keys() & requested,
            preq.responder_keys() & offered_keys(&self.config),
        );
        self.preq = Some(preq);
        self.pres = Some(pres);
        self.set_state(PairingState::FeatureExchange);

        if !self.negotiate(env) {
            return;
        }

        self.send(env, SmpPdu::PairingResponse(pres));
        self.begin_authentication(env);
    }

    fn on_pairing_response(&mut self, env: &mut PairingEnv<'_>, pres: PairingParameters) {
        if self.role != PairingRole::Initiator || self.state != PairingState::FeatureExchange {
            self.unexpected(env, SMP_PAIRING_RESPONSE);
            return;
        }

        self.pres = Some(pres);
        if self.negotiate(env) {
            self.begin_authentication(env);
        }
    }

    fn begin_authentication(&mut self, env: &mut PairingEnv<'_>) {
        if self.secure_connections {
            self.set_state(PairingState::PublicKeyExchange);
            let request = if self.model == AssociationModel::OutOfBand && self.local_oob_random.is_some() {
                CryptoRequest::OobKeyPair
            } else {
                CryptoRequest::GenerateKeyPair
            };
            self.request_crypto(env, request);
        } else {
            self.start_legacy_authentication(env);
        }
    }

    fn generate_passkey(&mut self, env: &mut PairingEnv<'_>) -> u32 {
        if let Some(passkey) = self.config.fixed_passkey {
            return passkey % (SMP_PASSKEY_MAX + 1);
        }
        let mut bytes = [0u8; 4];
        env.crypto.random_bytes(&mut bytes);
        let mut passkey = u32::from_le_bytes(bytes) & 0xFFFFF;
        if passkey >= SMP_PASSKEY_MAX {
            passkey -= SMP_PASSKEY_MAX;
        }
        passkey
    }

    /// Passkey Entry setup. Returns true if the passkey is already known.
    fn setup_passkey(&mut self, env: &mut PairingEnv<'_>) -> bool {
        if self.model.inputs_passkey(self.role) {
            env.user(UserRequest::PasskeyInput);
            self.set_state(PairingState::WaitForUserResponse(UserWait::PasskeyInput));
            false
        } else {
            let passkey = self.generate_passkey(env);
            self.passkey = Some(passkey);
            env.user(UserRequest::PasskeyDisplay(passkey));
            true
        }
    }

    // LE Legacy Pairing

    fn start_legacy_authentication(&mut self, env: &mut PairingEnv<'_>) {
        match self.model {
            AssociationModel::JustWorks if self.config.just_works_confirmation => {
                env.user(UserRequest::JustWorksConfirm);
                self.set_state(PairingState::WaitForUserResponse(UserWait::JustWorksConfirm));
            }
            AssociationModel::JustWorks | AssociationModel::OutOfBand => {
                self.legacy_tk_ready(env);
            }
            _ => {
                if self.setup_passkey(env) {
                    self.tk = u128::from(self.passkey.unwrap_or_default());
                    self.legacy_tk_ready(env);
                }
            }
        }
    }

    fn legacy_local_confirm(&self) -> u128 {
        crypto::c1(
            self.tk,
            self.local_nonce,
            &self.preq_bytes(),
            &self.pres_bytes(),
            self.initiator_address(),
            self.responder_address(),
        )
    }

    fn legacy_tk_ready(&mut self, env: &mut PairingEnv<'_>) {
        self.set_state(PairingState::LegacyConfirm);
        if self.is_initiator() {
            self.local_nonce = self.random_u128(env);
            let confirm = self.legacy_local_confirm();
            self.local_confirm = Some(confirm);
            self.send(env, SmpPdu::PairingConfirm(confirm.to_le_bytes()));
        } else if self.peer_confirm.is_some() {
            self.legacy_responder_confirm(env);
        }
    }

    fn legacy_responder_confirm(&mut self, env: &mut PairingEnv<'_>) {
        self.local_nonce = self.random_u128(env);
        let confirm = self.legacy_local_confirm();
        if Some(confirm) == self.peer_confirm {
            self.fail_local(env, FailureReason::UnspecifiedReason);
            return;
        }
        self.local_confirm = Some(confirm);
        self.send(env, SmpPdu::PairingConfirm(confirm.to_le_bytes()));
        self.set_state(PairingState::LegacyRandom);
    }

    fn legacy_check_peer_random(&mut self, env: &mut PairingEnv<'_>, random: u128) -> bool {
        let expected = crypto::c1(
            self.tk,
            random,
            &self.preq_bytes(),
            &self.pres_bytes(),
            self.initiator_address(),
            self.responder_address(),
        );
        if Some(expected) != self.peer_confirm {
            self.fail_local(env, FailureReason::ConfirmValueFailed);
            return false;
        }
        self.peer_nonce = random;
        true
    }

    fn legacy_derive_stk(&mut self) {
        let (srand, mrand) = match self.role {
            PairingRole::Initiator => (self.peer_nonce, self.local_nonce),
            PairingRole::Responder => (self.local_nonce, self.peer_nonce),
        };
        self.session_key = truncate_key(crypto::s1(self.tk, srand, mrand), self.key_size);
        trace!(
            "SMP 0x{:04x}: STK {}",
            self.handle,
            hex::encode(self.session_key.to_le_bytes())
        );
    }

    // LE Secure Connections

    fn on_public_key(&mut self, env: &mut PairingEnv<'_>, key: PublicKey) {
        if self.state != PairingState::PublicKeyExchange || self.peer_public_key.is_some() {
            self.unexpected(env, SMP_PAIRING_PUBLIC_KEY);
            return;
        }

        self.peer_public_key = Some(key);
        if let Some(local) = self.local_public_key {
            if !self.is_initiator() {
                self.send_public_key(env, &local);
            }
            self.request_crypto(env, CryptoRequest::ComputeDhKey(key));
        } else if self.is_initiator() {
            // Our key has not been sent yet, so the peer cannot have answered
            self.unexpected(env, SMP_PAIRING_PUBLIC_KEY);
        }
    }

    fn local_x(&self) -> [u8; 32] {
        self.local_public_key.map(|key| key.x).unwrap_or_default()
    }

    fn peer_x(&self) -> [u8; 32] {
        self.peer_public_key.map(|key| key.x).unwrap_or_default()
    }

    fn passkey_z(&self) -> u8 {
        let passkey = self.passkey.unwrap_or_default();
        0x80 | ((passkey >> self.passkey_round) & 0x01) as u8
    }

    fn sc_z(&self) -> u8 {
        if self.model.method() == PairingMethod::PasskeyEntry {
            self.passkey_z()
        } else {
            0
        }
    }

    fn sc_local_confirm(&self) -> u128 {
        crypto::f4(&self.local_x(), &self.peer_x(), self.local_nonce, self.sc_z())
    }

    fn sc_check_peer_confirm(&mut self, env: &mut PairingEnv<'_>) -> bool {
        let expected = crypto::f4(&self.peer_x(), &self.local_x(), self.peer_nonce, self.sc_z());
        if Some(expected) != self.peer_confirm {
            self.fail_local(env, FailureReason::ConfirmValueFailed);
            return false;
        }
        true
    }

    fn start_sc_authentication(&mut self, env: &mut PairingEnv<'_>) {
        match self.model {
            AssociationModel::JustWorks | AssociationModel::NumericComparison => {
                self.set_state(PairingState::ScConfirm);
                if !self.is_initiator() {
                    self.local_nonce = self.random_u128(env);
                    let confirm = self.sc_local_confirm();
                    self.local_confirm = Some(confirm);
                    self.send(env, SmpPdu::PairingConfirm(confirm.to_le_bytes()));
                    self.set_state(PairingState::ScRandom);
                }
            }
            AssociationModel::OutOfBand => {
                if let Some(OobData::SecureConnections { random, confirm }) = &self.config.oob_data {
                    let peer_x = self.peer_x();
                    let expected = crypto::f4(&peer_x, &peer_x, u128::from_le_bytes(*random), 0);
                    if expected != u128::from_le_bytes(*confirm) {
                        self.fail_local(env, FailureReason::ConfirmValueFailed);
                        return;
                    }
                }
                self.set_state(PairingState::ScRandom);
                if self.is_initiator() {
                    self.local_nonce = self.random_u128(env);
                    self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                }
            }
            _ => {
                if self.setup_passkey(env) {
                    self.sc_passkey_round(env);
                }
            }
        }
    }

    fn sc_passkey_round(&mut self, env: &mut PairingEnv<'_>) {
        self.set_state(PairingState::ScConfirm);
        if self.is_initiator() {
            self.local_nonce = self.random_u128(env);
            let confirm = self.sc_local_confirm();
            self.local_confirm = Some(confirm);
            self.send(env, SmpPdu::PairingConfirm(confirm.to_le_bytes()));
        } else if self.peer_confirm.is_some() {
            self.sc_responder_passkey_confirm(env);
        }
    }

    fn sc_responder_passkey_confirm(&mut self, env: &mut PairingEnv<'_>) {
        self.local_nonce = self.random_u128(env);
        let confirm = self.sc_local_confirm();
        if Some(confirm) == self.peer_confirm {
            self.fail_local(env, FailureReason::UnspecifiedReason);
            return;
        }
        self.local_confirm = Some(confirm);
        self.send(env, SmpPdu::PairingConfirm(confirm.to_le_bytes()));
        self.set_state(PairingState::ScRandom);
    }

    fn on_pairing_confirm(&mut self, env: &mut PairingEnv<'_>, confirm: u128) {
        let waiting_for_passkey =
            self.state == PairingState::WaitForUserResponse(UserWait::PasskeyInput);
        let waiting_for_jw = self.state == PairingState::WaitForUserResponse(UserWait::JustWorksConfirm)
            && !self.secure_connections;

        match (self.role, self.state) {
            (PairingRole::Initiator, PairingState::LegacyConfirm)
            | (PairingRole::Initiator, PairingState::ScConfirm) => {
                if Some(confirm) == self.local_confirm {
                    self.fail_local(env, FailureReason::UnspecifiedReason);
                    return;
                }
                self.peer_confirm = Some(confirm);
                if self.state == PairingState::ScConfirm
                    && self.model.method() != PairingMethod::PasskeyEntry
                {
                    self.local_nonce = self.random_u128(env);
                }
                let next = if self.secure_connections {
                    PairingState::ScRandom
                } else {
                    PairingState::LegacyRandom
                };
                self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                self.set_state(next);
            }
            (PairingRole::Responder, PairingState::LegacyConfirm) => {
                self.peer_confirm = Some(confirm);
                self.legacy_responder_confirm(env);
            }
            (PairingRole::Responder, PairingState::ScConfirm)
                if self.model.method() == PairingMethod::PasskeyEntry =>
            {
                self.peer_confirm = Some(confirm);
                self.sc_responder_passkey_confirm(env);
            }
            (PairingRole::Responder, _)
                if (waiting_for_passkey || waiting_for_jw) && self.peer_confirm.is_none() =>
            {
                self.peer_confirm = Some(confirm);
            }
            _ => self.unexpected(env, SMP_PAIRING_CONFIRM),
        }
    }

    fn on_pairing_random(&mut self, env: &mut PairingEnv<'_>, random: u128) {
        match (self.role, self.state) {
            (PairingRole::Responder, PairingState::LegacyRandom) => {
                if self.legacy_check_peer_random(env, random) {
                    self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                    self.legacy_derive_stk();
                    self.set_state(PairingState::WaitForEncryption);
                }
            }
            (PairingRole::Initiator, PairingState::LegacyRandom) => {
                if self.legacy_check_peer_random(env, random) {
                    self.legacy_derive_stk();
                    self.start_encryption(env);
                }
            }
            (PairingRole::Responder, PairingState::ScRandom) => {
                self.peer_nonce = random;
                match self.model {
                    AssociationModel::JustWorks | AssociationModel::NumericComparison => {
                        self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                        self.sc_stage1_complete(env);
                    }
                    AssociationModel::OutOfBand => {
                        self.local_nonce = self.random_u128(env);
                        self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                        self.sc_stage1_complete(env);
                    }
                    _ => {
                        if self.sc_check_peer_confirm(env) {
                            self.send(env, SmpPdu::PairingRandom(self.local_nonce.to_le_bytes()));
                            self.sc_passkey_round_complete(env);
                        }
                    }
                }
            }
            (PairingRole::Initiator, PairingState::ScRandom) => {
                self.peer_nonce = random;
                match self.model {
                    AssociationModel::OutOfBand => self.sc_stage1_complete(env),
                    AssociationModel::JustWorks | AssociationModel::NumericComparison => {
                        if self.sc_check_peer_confirm(env) {
                            self.sc_stage1_complete(env);
                        }
                    }
                    _ => {
                        if self.sc_check_peer_confirm(env) {
                            self.sc_passkey_round_complete(env);
                        }
                    }
                }
            }
            _ => self.unexpected(env, SMP_PAIRING_RANDOM),
        }
    }

    fn sc_passkey_round_complete(&mut self, env: &mut PairingEnv<'_>) {
        self.passkey_round += 1;
        self.peer_confirm = None;
        self.local_confirm = None;
        if self.passkey_round >= SMP_PASSKEY_ROUNDS {
            self.sc_stage1_complete(env);
        } else {
            self.sc_passkey_round(env);
        }
    }

    fn nonces(&self) -> (u128, u128) {
        match self.role {
            PairingRole::Initiator => (self.local_nonce, self.peer_nonce),
            PairingRole::Responder => (self.peer_nonce, self.local_nonce),
        }
    }

    fn sc_stage1_complete(&mut self, env: &mut PairingEnv<'_>) {
        let dh_key = match &self.dh_key {
            Some(key) => key.clone(),
            None => {
                self.fail_local(env, FailureReason::UnspecifiedReason);
                return;
            }
        };

        let (na, nb) = self.nonces();
        let a = *self.initiator_address();
        let b = *self.responder_address();
        let (mac_key, ltk) = crypto::f5(&dh_key, na, nb, &a, &b);
        self.mac_key = mac_key;
        self.session_key = truncate_key(ltk, self.key_size);
        trace!(
            "SMP 0x{:04x}: LTK {}",
            self.handle,
            hex::encode(self.session_key.to_le_bytes())
        );

        match self.model {
            AssociationModel::NumericComparison => {
                let (pka, pkb) = match self.role {
                    PairingRole::Initiator => (self.local_x(), self.peer_x()),
                    PairingRole::Responder => (self.peer_x(), self.local_x()),
                };
                let value = crypto::g2(&pka, &pkb, na, nb);
                env.user(UserRequest::NumericComparison(value));
                self.set_state(PairingState::WaitForUserResponse(
                    UserWait::NumericComparisonConfirm,
                ));
            }
            AssociationModel::JustWorks if self.config.just_works_confirmation => {
                env.user(UserRequest::JustWorksConfirm);
                self.set_state(PairingState::WaitForUserResponse(UserWait::JustWorksConfirm));
            }
            _ => self.sc_stage2(env),
        }
    }

    /// `(ra, rb)` for the DHKey checks
    fn check_randoms(&self) -> (u128, u128) {
        match self.model.method() {
            PairingMethod::PasskeyEntry => {
                let passkey = u128::from(self.passkey.unwrap_or_default());
                (passkey, passkey)
            }
            PairingMethod::OutOfBand => {
                let peer = match &self.config.oob_data {
                    Some(OobData::SecureConnections { random, .. }) => u128::from_le_bytes(*random),
                    _ => 0,
                };
                // Our r only counts if the peer received our OOB data
                let peer_params = match self.role {
                    PairingRole::Initiator => self.pres,
                    PairingRole::Responder => self.preq,
                };
                let local = match peer_params {
                    Some(params) if params.oob_present() => self.local_oob_random.unwrap_or_default(),
                    _ => 0,
                };
                match self.role {
                    PairingRole::Initiator => (local, peer),
                    PairingRole::Responder => (peer, local),
                }
            }
            _ => (0, 0),
        }
    }

    /// `(Ea, Eb)`
    fn dhkey_checks(&self) -> (u128, u128) {
        let (na, nb) = self.nonces();
        let (ra, rb) = self.check_randoms();
        let a = self.initiator_address();
        let b = self.responder_address();
        let (Some(preq), Some(pres)) = (self.preq, self.pres) else {
            return (0, 0);
        };
        let iocap_a = IoCap::new(preq.auth_req, preq.oob_data_flag, preq.io_capability);
        let iocap_b = IoCap::new(pres.auth_req, pres.oob_data_flag, pres.io_capability);

        let ea = crypto::f6(self.mac_key, na, nb, rb, &iocap_a, a, b);
        let eb = crypto::f6(self.mac_key, nb, na, ra, &iocap_b, b, a);
        (ea, eb)
    }

    fn sc_stage2(&mut self, env: &mut PairingEnv<'_>) {
        self.set_state(PairingState::DhKeyCheck);
        if self.is_initiator() {
            let (ea, _) = self.dhkey_checks();
            self.send(env, SmpPdu::PairingDhKeyCheck(ea.to_le_bytes()));
        } else if let Some(check) = self.peer_dhkey_check.take() {
            self.responder_verify_dhkey_check(env, check);
        }
    }

    fn responder_verify_dhkey_check(&mut self, env: &mut PairingEnv<'_>, check: u128) {
        let (ea, eb) = self.dhkey_checks();
        if check != ea {
            self.fail_local(env, FailureReason::DhKeyCheckFailed);
            return;
        }
        self.send(env, SmpPdu::PairingDhKeyCheck(eb.to_le_bytes()));
        self.set_state(PairingState::WaitForEncryption);
    }

    fn on_dhkey_check(&mut self, env: &mut PairingEnv<'_>, check: u128) {
        match (self.role, self.state) {
            (PairingRole::Initiator, PairingState::DhKeyCheck) => {
                let (_, eb) = self.dhkey_checks();
                if check != eb {
                    self.fail_local(env, FailureReason::DhKeyCheckFailed);
                    return;
                }
                self.start_encryption(env);
            }
            (PairingRole::Responder, PairingState::DhKeyCheck) => {
                self.responder_verify_dhkey_check(env, check);
            }
            (PairingRole::Responder, PairingState::WaitForUserResponse(wait))
                if wait != UserWait::PasskeyInput && self.peer_dhkey_check.is_none() =>
            {
                self.peer_dhkey_check = Some(check);
            }
            _ => self.unexpected(env, SMP_PAIRING_DHK_CHECK),
        }
    }

    // User responses

    /// Answer a pending passkey input request
    pub fn passkey_input(&mut self, env: &mut PairingEnv<'_>, passkey: u32) -> SmpResult<()> {
        if passkey > SMP_PASSKEY_MAX {
            return Err(SmpError::InvalidParameter(format!(
                "passkey {} has more than six digits",
                passkey
            )));
        }
        if self.state != PairingState::WaitForUserResponse(UserWait::PasskeyInput) {
            return Err(SmpError::InvalidState);
        }

        self.touch(env.now);
        self.passkey = Some(passkey);
        if self.secure_connections {
            self.sc_passkey_round(env);
        } else {
            self.tk = u128::from(passkey);
            self.legacy_tk_ready(env);
        }
        Ok(())
    }

    /// Answer a pending Numeric Comparison or Just Works confirmation
    pub fn confirm(&mut self, env: &mut PairingEnv<'_>, wait: UserWait) -> SmpResult<()> {
        if self.state != PairingState::WaitForUserResponse(wait) || wait == UserWait::PasskeyInput
        {
            return Err(SmpError::InvalidState);
        }

        self.touch(env.now);
        if self.secure_connections {
            self.sc_stage2(env);
        } else {
            self.legacy_tk_ready(env);
        }
        Ok(())
    }

    /// Refuse the attempt on behalf of the user
    pub fn decline(&mut self, env: &mut PairingEnv<'_>) -> SmpResult<()> {
        if self.is_finished() {
            return Err(SmpError::NoPairingInProgress(self.handle));
        }

        let reason = match (self.pres, self.model.method()) {
            (Some(_), PairingMethod::PasskeyEntry) => FailureReason::PasskeyEntryFailed,
            (Some(_), PairingMethod::NumericComparison) => FailureReason::NumericComparisonFailed,
            _ => FailureReason::UnspecifiedReason,
        };
        self.fail_local(env, reason);
        Ok(())
    }

    /// Send a keypress notification while the user types the passkey
    pub fn keypress(
        &mut self,
        env: &mut PairingEnv<'_>,
        notification: KeypressNotificationType,
    ) -> SmpResult<()> {
        let both_keypress = match (self.preq, self.pres) {
            (Some(preq), Some(pres)) => {
                preq.auth().keypress_notifications && pres.auth().keypress_notifications
            }
            _ => false,
        };
        if !both_keypress
            || self.state != PairingState::WaitForUserResponse(UserWait::PasskeyInput)
        {
            return Err(SmpError::InvalidState);
        }

        self.send(env, SmpPdu::KeypressNotification(notification.to_u8()));
        Ok(())
    }

    // Encryption and key distribution

    fn start_encryption(&mut self, env: &mut PairingEnv<'_>) {
        self.set_state(PairingState::WaitForEncryption);
        env.actions.push(PairingAction::StartEncryption(LongTermKey::new(
            self.session_key.to_le_bytes(),
            0,
            [0; 8],
        )));
    }

    /// Link encryption status while waiting for encryption
    pub fn encryption_changed(&mut self, env: &mut PairingEnv<'_>, status: u8) {
        if self.state != PairingState::WaitForEncryption {
            debug!(
                "SMP 0x{:04x}: encryption change ignored in state {:?}",
                self.handle, self.state
            );
            return;
        }
        if status != 0 {
            self.fail(env, PairingFailure::Encryption(status));
            return;
        }

        self.touch(env.now);
        self.set_state(PairingState::KeyDistribution);
        for (flag, opcodes) in [
            (
                KeyDistribution::ENC_KEY,
                &[SMP_ENCRYPTION_INFORMATION, SMP_MASTER_IDENTIFICATION][..],
            ),
            (
                KeyDistribution::ID_KEY,
                &[SMP_IDENTITY_INFORMATION, SMP_IDENTITY_ADDRESS_INFORMATION][..],
            ),
            (KeyDistribution::SIGN_KEY, &[SMP_SIGNING_INFORMATION][..]),
        ] {
            if self.keys_to_receive.contains(flag) {
                self.expected_key_pdus.extend(opcodes.iter().copied());
            }
        }

        if !self.is_initiator() {
            self.distribute_keys(env);
        }
        self.check_key_distribution_complete(env);
    }

    fn distribute_keys(&mut self, env: &mut PairingEnv<'_>) {
        if self.keys_to_send.contains(KeyDistribution::ENC_KEY) {
            let ltk = truncate_key(self.random_u128(env), self.key_size).to_le_bytes();
            let mut ediv = [0u8; 2];
            let mut rand = [0u8; 8];
            env.crypto.random_bytes(&mut ediv);
            env.crypto.random_bytes(&mut rand);
            let ediv = u16::from_le_bytes(ediv);

            self.local_keys.ltk = Some(ltk);
            self.local_keys.ediv_rand = Some((ediv, rand));
            self.send(env, SmpPdu::EncryptionInformation(ltk));
            self.send(env, SmpPdu::MasterIdentification { ediv, rand });
        }

        if self.keys_to_send.contains(KeyDistribution::ID_KEY) {
            if let Some(identity) = self.config.identity.clone() {
                self.local_keys.irk = Some(identity.irk);
                self.local_keys.identity = Some(identity.address);
                self.send(env, SmpPdu::IdentityInformation(identity.irk));
                self.send(
                    env,
                    SmpPdu::IdentityAddressInformation {
                        address_type: identity.address.address_type.to_u8(),
                        address: identity.address.address,
                    },
                );
            }
        }

        if self.keys_to_send.contains(KeyDistribution::SIGN_KEY) {
            if let Some(csrk) = self.config.csrk {
                self.local_keys.csrk = Some(csrk);
                self.send(env, SmpPdu::SigningInformation(csrk));
            }
        }

        self.keys_sent = true;
    }

    fn on_key_pdu(&mut self, env: &mut PairingEnv<'_>, pdu: SmpPdu) {
        if self.state != PairingState::KeyDistribution
            || self.expected_key_pdus.front() != Some(&pdu.opcode())
        {
            self.unexpected(env, pdu.opcode());
            return;
        }
        self.expected_key_pdus.pop_front();

        match pdu {
            SmpPdu::EncryptionInformation(ltk) => self.peer_keys.ltk = Some(ltk),
            SmpPdu::MasterIdentification { ediv, rand } => {
                self.peer_keys.ediv_rand = Some((ediv, rand))
            }
            SmpPdu::IdentityInformation(irk) => self.peer_keys.irk = Some(irk),
            SmpPdu::IdentityAddressInformation { .. } => {
                self.peer_keys.identity = pdu.identity_address()
            }
            SmpPdu::SigningInformation(csrk) => self.peer_keys.csrk = Some(csrk),
            _ => {}
        }

        self.check_key_distribution_complete(env);
    }

    fn check_key_distribution_complete(&mut self, env: &mut PairingEnv<'_>) {
        if !self.expected_key_pdus.is_empty() || self.is_finished() {
            return;
        }
        if !self.keys_sent {
            self.distribute_keys(env);
        }

        let result = self.result();
        info!(
            "SMP 0x{:04x}: pairing with {} complete ({}, {})",
            self.handle,
            self.peer_address,
            result.summary.method,
            if self.secure_connections { "Secure Connections" } else { "Legacy" }
        );
        self.set_state(PairingState::Complete);
        env.actions.push(PairingAction::Finished(Ok(result)));
    }

    fn bonding_requested(&self) -> bool {
        match (self.preq, self.pres) {
            (Some(preq), Some(pres)) => preq.auth().bonding && pres.auth().bonding,
            _ => false,
        }
    }

    fn result(&self) -> PairingResult {
        let authenticated = self.model != AssociationModel::JustWorks;
        let summary = PairingSummary {
            method: self.model.method(),
            secure_connections: self.secure_connections,
            authenticated,
            key_size: self.key_size,
            security_level: SecurityLevel::from_link(true, authenticated, self.secure_connections),
            bonded_slot: None,
        };

        let bond = self.bonding_requested().then(|| {
            let address = self.peer_keys.identity.unwrap_or(self.peer_address);
            let mut entry = BondingEntry::new(address);
            entry.irk = self.peer_keys.irk;
            entry.ltk = if self.secure_connections {
                Some(LongTermKey::new_secure_connections(
                    self.session_key.to_le_bytes(),
                ))
            } else {
                match self.role {
                    PairingRole::Initiator => self.peer_keys.long_term_key(),
                    PairingRole::Responder => self.local_keys.long_term_key(),
                }
            };
            entry.key_size = self.key_size;
            entry.authenticated = authenticated;
            entry.secure_connections = self.secure_connections;
            entry.local_csrk = self.local_keys.csrk.map(SigningKey::new);
            entry.remote_csrk = self.peer_keys.csrk.map(SigningKey::new);
            entry
        });

        PairingResult {
            summary,
            bond,
            peer_identity: self.peer_keys.identity,
        }
    }

    // Termination

    /// Fail the attempt if its timer has expired
    pub fn poll_timeout(&mut self, env: &mut PairingEnv<'_>) {
        if !self.is_finished() && env.now >= self.deadline {
            self.fail(env, PairingFailure::Timeout);
        }
    }

    /// The link went down
    pub fn disconnected(&mut self, env: &mut PairingEnv<'_>) {
        self.fail(env, PairingFailure::Disconnected);
    }

    /// End the attempt for a reason found outside the state machine, such as
    /// an undecodable PDU
    pub fn abort(&mut self, env: &mut PairingEnv<'_>, failure: PairingFailure) {
        self.fail(env, failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::crypto::SoftwareCrypto;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn params(io: u8, oob: bool, auth_req: u8) -> PairingParameters {
        PairingParameters {
            io_capability: io,
            oob_data_flag: u8::from(oob),
            auth_req,
            max_key_size: 16,
            initiator_key_distribution: 0,
            responder_key_distribution: 0,
        }
    }

    const MITM: u8 = SMP_AUTH_REQ_MITM;
    const MITM_SC: u8 = SMP_AUTH_REQ_MITM | SMP_AUTH_REQ_SC;

    #[test]
    fn test_method_tables_match_core_spec() {
        for responder in 0..5u8 {
            for initiator in 0..5u8 {
                let preq = params(initiator, false, MITM);
                let pres = params(responder, false, MITM);
                let (sc, model) = select_method(&preq, &pres);
                assert!(!sc);
                assert_eq!(
                    model,
                    LEGACY_METHOD_TABLE[usize::from(responder)][usize::from(initiator)]
                );
                assert_ne!(model, NC);

                let preq = params(initiator, false, MITM_SC);
                let pres = params(responder, false, MITM_SC);
                let (sc, model) = select_method(&preq, &pres);
                assert!(sc);
                assert_eq!(
                    model,
                    SC_METHOD_TABLE[usize::from(responder)][usize::from(initiator)]
                );
            }
        }
    }

    #[test]
    fn test_selected_methods_for_known_pairs() {
        let display_only = SMP_IO_CAPABILITY_DISPLAY_ONLY;
        let yes_no = SMP_IO_CAPABILITY_DISPLAY_YES_NO;
        let keyboard = SMP_IO_CAPABILITY_KEYBOARD_ONLY;
        let no_io = SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT;
        let kbd_display = SMP_IO_CAPABILITY_KEYBOARD_DISPLAY;

        let cases = [
            (display_only, keyboard, MITM, PK_RESP),
            (keyboard, display_only, MITM, PK_INIT),
            (keyboard, keyboard, MITM, PK_BOTH),
            (kbd_display, kbd_display, MITM, PK_RESP),
            (no_io, keyboard, MITM, JW),
            (yes_no, yes_no, MITM, JW),
            (yes_no, yes_no, MITM_SC, NC),
            (kbd_display, yes_no, MITM_SC, NC),
            (kbd_display, kbd_display, MITM_SC, NC),
            (keyboard, yes_no, MITM_SC, PK_INIT),
        ];

        for (initiator, responder, auth, expected) in cases {
            let (_, model) =
                select_method(&params(initiator, false, auth), &params(responder, false, auth));
            assert_eq!(
                model, expected,
                "initiator io {} responder io {}",
                initiator, responder
            );
        }
    }

    #[test]
    fn test_no_mitm_gives_just_works() {
        for responder in 0..5u8 {
            for initiator in 0..5u8 {
                for sc in [0, SMP_AUTH_REQ_SC] {
                    let (_, model) = select_method(
                        &params(initiator, false, SMP_AUTH_REQ_BONDING | sc),
                        &params(responder, false, SMP_AUTH_REQ_BONDING | sc),
                    );
                    assert_eq!(model, JW);
                }
            }
        }

        // One side asking for MITM is enough to use the table
        let (_, model) = select_method(&params(0, false, MITM), &params(2, false, 0));
        assert_eq!(model, PK_RESP);
    }

    #[test]
    fn test_oob_overrides() {
        // Legacy needs both flags
        let (sc, model) = select_method(&params(3, true, 0), &params(3, true, 0));
        assert!(!sc);
        assert_eq!(model, AssociationModel::OutOfBand);
        let (_, model) = select_method(&params(2, true, MITM), &params(0, false, MITM));
        assert_eq!(model, PK_INIT);

        // Secure Connections needs either flag
        let sc_auth = SMP_AUTH_REQ_SC;
        let (sc, model) = select_method(&params(3, true, sc_auth), &params(3, false, sc_auth));
        assert!(sc);
        assert_eq!(model, AssociationModel::OutOfBand);
        let (_, model) = select_method(&params(3, false, sc_auth), &params(3, true, sc_auth));
        assert_eq!(model, AssociationModel::OutOfBand);
    }

    #[test]
    fn test_secure_connections_needs_both_bits() {
        let (sc, _) = select_method(&params(1, false, MITM_SC), &params(1, false, MITM));
        assert!(!sc);
    }

    #[test]
    fn test_reserved_io_capability_gives_just_works() {
        let (_, model) = select_method(&params(7, false, MITM), &params(2, false, MITM));
        assert_eq!(model, JW);
    }

    #[test]
    fn test_truncate_key() {
        let key = u128::from_le_bytes([0xFF; 16]);
        let truncated = truncate_key(key, 7).to_le_bytes();
        assert_eq!(&truncated[..7], &[0xFF; 7]);
        assert_eq!(&truncated[7..], &[0x00; 9]);
        assert_eq!(truncate_key(key, 16), key);
    }

    #[test]
    fn test_key_distribution_sets() {
        let mut config = SecurityConfig::default();
        assert_eq!(
            requested_keys(&config.auth_req),
            KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY | KeyDistribution::SIGN_KEY
        );
        assert_eq!(offered_keys(&config), KeyDistribution::ENC_KEY);

        config.auth_req.bonding = false;
        config.csrk = Some([1; 16]);
        assert_eq!(requested_keys(&config.auth_req), KeyDistribution::ID_KEY);
        assert_eq!(
            offered_keys(&config),
            KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY
        );
    }

    fn responder_context(config: SecurityConfig, now: Instant) -> PairingContext {
        PairingContext::new_responder(
            0x0040,
            1,
            config,
            LeAddress::public([1, 2, 3, 4, 5, 6]),
            LeAddress::random([6, 5, 4, 3, 2, 0xC1]),
            now,
        )
    }

    #[test]
    fn test_responder_rejects_short_key() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut config = SecurityConfig::default();
        config.min_key_size = 16;
        let mut ctx = responder_context(config, now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        let mut preq = params(3, false, SMP_AUTH_REQ_BONDING);
        preq.max_key_size = 10;
        ctx.handle_pdu(&mut env, SmpPdu::PairingRequest(preq));

        assert_eq!(ctx.state(), PairingState::Failed);
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(FailureReason::EncryptionKeySize))
        );
        assert!(matches!(
            actions[1],
            PairingAction::Finished(Err(PairingFailure::Local(
                FailureReason::EncryptionKeySize
            )))
        ));
    }

    #[test]
    fn test_responder_rejects_invalid_io_capability() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut ctx = responder_context(SecurityConfig::default(), now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        ctx.handle_pdu(&mut env, SmpPdu::PairingRequest(params(9, false, 0)));
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(FailureReason::InvalidParameters))
        );
    }

    #[test]
    fn test_responder_rejects_reserved_bonding_flags() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut ctx = responder_context(SecurityConfig::default(), now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        ctx.handle_pdu(&mut env, SmpPdu::PairingRequest(params(3, false, 0x02)));
        assert_eq!(ctx.state(), PairingState::Failed);
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(FailureReason::InvalidParameters))
        );
        assert!(matches!(
            actions[1],
            PairingAction::Finished(Err(PairingFailure::Local(
                FailureReason::InvalidParameters
            )))
        ));
    }

    #[test]
    fn test_mitm_required_but_just_works() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut config = SecurityConfig::default();
        config.auth_req.mitm = true;
        let mut ctx = responder_context(config, now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        ctx.handle_pdu(
            &mut env,
            SmpPdu::PairingRequest(params(SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT, false, 0)),
        );
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(FailureReason::PairingNotSupported))
        );
    }

    #[test]
    fn test_secure_connections_only_rejects_legacy() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut config = SecurityConfig::default();
        config.auth_req.secure_connections = true;
        config.secure_connections_only = true;
        let mut ctx = responder_context(config, now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        ctx.handle_pdu(&mut env, SmpPdu::PairingRequest(params(3, false, 0)));
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(
                FailureReason::AuthenticationRequirements
            ))
        );
    }

    #[test]
    fn test_unexpected_pdu_and_timeout() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let now = Instant::now();

        let mut actions = Vec::new();
        let mut ctx = responder_context(SecurityConfig::default(), now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };
        ctx.handle_pdu(&mut env, SmpPdu::PairingRandom([0; 16]));
        assert_eq!(
            actions[0],
            PairingAction::Send(SmpPdu::PairingFailed(FailureReason::UnspecifiedReason))
        );

        let mut actions = Vec::new();
        let mut ctx = responder_context(SecurityConfig::default(), now);
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now: now + Duration::from_secs(29),
        };
        ctx.poll_timeout(&mut env);
        assert!(!ctx.is_finished());

        env.now = now + Duration::from_secs(30);
        ctx.poll_timeout(&mut env);
        assert!(ctx.is_finished());
        assert_eq!(
            actions,
            vec![PairingAction::Finished(Err(PairingFailure::Timeout))]
        );
    }

    #[test]
    fn test_peer_failure_ends_attempt_without_reply() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(3));
        let mut actions = Vec::new();
        let now = Instant::now();
        let mut ctx = PairingContext::new_initiator(
            0x0040,
            1,
            SecurityConfig::default(),
            LeAddress::public([1, 2, 3, 4, 5, 6]),
            LeAddress::public([6, 5, 4, 3, 2, 1]),
            now,
        );
        let mut env = PairingEnv {
            crypto: &mut crypto,
            actions: &mut actions,
            now,
        };

        ctx.start(&mut env).unwrap();
        assert!(ctx.start(&mut env).is_err());
        ctx.handle_pdu(&mut env, SmpPdu::SecurityRequest { auth_req: 0x01 });
        assert_eq!(ctx.state(), PairingState::FeatureExchange);

        ctx.handle_pdu(
            &mut env,
            SmpPdu::PairingFailed(FailureReason::PairingNotSupported),
        );
        assert_eq!(ctx.state(), PairingState::Failed);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], PairingAction::Send(SmpPdu::PairingRequest(_))));
        assert_eq!(
            actions[1],
            PairingAction::Finished(Err(PairingFailure::Remote(
                FailureReason::PairingNotSupported
            )))
        );
    }
}
