//! Cryptographic functions for the Security Manager Protocol
//!
//! This module implements the toolbox of BT Core Spec Vol 3, Part H, 2.2 on
//! top of the RustCrypto AES, CMAC and P-256 crates, plus the request/response
//! adapter through which the pairing state machine reaches the random source
//! and the elliptic curve operations.
//!
//! All 128-bit values are handled as `u128` with the most significant octet
//! first, as the Core Spec writes them. PDUs carry them little-endian, so
//! callers convert with `u128::from_le_bytes` / `to_le_bytes`.

use super::constants::SMP_F5_SALT;
use super::types::ConnectionHandle;
use crate::gap::constants::{RANDOM_ADDRESS_SUBTYPE_MASK, RANDOM_ADDRESS_SUBTYPE_RESOLVABLE};
use crate::gap::{BdAddr, LeAddress};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use log::{trace, warn};
use p256::ecdh;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, NonZeroScalar};
use rand::rngs::StdRng;
use rand::{CryptoRng, RngCore, SeedableRng};
use std::collections::HashMap;

/// Security function e: AES-128 encryption of one block (Vol 3, Part H, 2.2.1)
pub fn e(key: u128, plaintext: u128) -> u128 {
    let cipher = <Aes128 as KeyInit>::new(&GenericArray::from(key.to_be_bytes()));
    let mut block = GenericArray::from(plaintext.to_be_bytes());
    cipher.encrypt_block(&mut block);
    u128::from_be_bytes(block.into())
}

/// AES-CMAC over the concatenation of `parts` (Vol 3, Part H, 2.2.5)
fn aes_cmac(key: u128, parts: &[&[u8]]) -> u128 {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(&GenericArray::from(key.to_be_bytes()));
    for part in parts {
        mac.update(part);
    }
    u128::from_be_bytes(mac.finalize().into_bytes().into())
}

/// Legacy confirm value generation function c1 (Vol 3, Part H, 2.2.3)
///
/// `preq` and `pres` are the complete Pairing Request and Pairing Response
/// PDUs as sent on air, opcode included.
pub fn c1(
    k: u128,
    r: u128,
    preq: &[u8; 7],
    pres: &[u8; 7],
    initiator: &LeAddress,
    responder: &LeAddress,
) -> u128 {
    // p1 = pres || preq || rat' || iat'
    let mut p1 = [0u8; 16];
    for i in 0..7 {
        p1[i] = pres[6 - i];
        p1[7 + i] = preq[6 - i];
    }
    p1[14] = responder.address_type.to_u8();
    p1[15] = initiator.address_type.to_u8();

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(&initiator.address.to_be_bytes());
    p2[10..16].copy_from_slice(&responder.address.to_be_bytes());

    let p1 = u128::from_be_bytes(p1);
    let p2 = u128::from_be_bytes(p2);
    e(k, e(k, r ^ p1) ^ p2)
}

/// Legacy key generation function s1 (Vol 3, Part H, 2.2.4)
///
/// `r1` is the responder's random (Srand), `r2` the initiator's (Mrand).
pub fn s1(k: u128, r1: u128, r2: u128) -> u128 {
    let r_prime = (r1 << 64) | (r2 & u128::from(u64::MAX));
    e(k, r_prime)
}

/// LE Secure Connections confirm value generation function f4 (Vol 3, Part H, 2.2.6)
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: u128, z: u8) -> u128 {
    aes_cmac(x, &[u, v, &[z]])
}

/// LE Secure Connections key generation function f5 (Vol 3, Part H, 2.2.7)
///
/// Returns `(MacKey, LTK)`.
pub fn f5(w: &DhKey, n1: u128, n2: u128, a1: &LeAddress, a2: &LeAddress) -> (u128, u128) {
    let t = aes_cmac(SMP_F5_SALT, &[&w.0]);
    let n1 = n1.to_be_bytes();
    let n2 = n2.to_be_bytes();
    let a1 = a1.to_bytes();
    let a2 = a2.to_bytes();
    let length = 256u16.to_be_bytes();

    let half = |counter: u8| aes_cmac(t, &[&[counter], b"btle", &n1, &n2, &a1, &a2, &length]);
    (half(0), half(1))
}

/// LE Secure Connections check value generation function f6 (Vol 3, Part H, 2.2.8)
pub fn f6(
    w: u128,
    n1: u128,
    n2: u128,
    r: u128,
    io_cap: &IoCap,
    a1: &LeAddress,
    a2: &LeAddress,
) -> u128 {
    aes_cmac(
        w,
        &[
            &n1.to_be_bytes(),
            &n2.to_be_bytes(),
            &r.to_be_bytes(),
            &io_cap.0,
            &a1.to_bytes(),
            &a2.to_bytes(),
        ],
    )
}

/// LE Secure Connections numeric comparison value generation function g2
/// (Vol 3, Part H, 2.2.9), reduced to six decimal digits
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: u128, y: u128) -> u32 {
    let value = aes_cmac(x, &[u, v, &y.to_be_bytes()]);
    (value as u32) % 1_000_000
}

/// Data signing algorithm (Vol 3, Part H, 2.4.5)
///
/// `csrk` and `message` are in wire order. The MAC covers `message ||
/// counter` and its 64 most significant bits are returned in wire order.
pub fn sign_data(csrk: &[u8; 16], message: &[u8], counter: u32) -> [u8; 8] {
    let mut m = Vec::with_capacity(message.len() + 4);
    m.extend_from_slice(message);
    m.extend_from_slice(&counter.to_le_bytes());
    m.reverse();

    let mac = aes_cmac(u128::from_le_bytes(*csrk), &[&m]);
    ((mac >> 64) as u64).to_le_bytes()
}

/// Random address hash function ah (Vol 3, Part H, 2.2.2)
///
/// `r` is the 24-bit prand, most significant octet first. Returns the hash in
/// the same order.
pub fn ah(k: u128, r: [u8; 3]) -> [u8; 3] {
    let mut r_prime = [0u8; 16];
    r_prime[13..].copy_from_slice(&r);
    let out = e(k, u128::from_be_bytes(r_prime)).to_be_bytes();
    [out[13], out[14], out[15]]
}

/// Check whether a resolvable private address was generated from `irk`
///
/// `irk` is in wire (little-endian) order.
pub fn resolve_private_address(irk: &[u8; 16], address: &BdAddr) -> bool {
    let bytes = address.bytes;
    if bytes[5] & RANDOM_ADDRESS_SUBTYPE_MASK != RANDOM_ADDRESS_SUBTYPE_RESOLVABLE {
        return false;
    }

    let prand = [bytes[5], bytes[4], bytes[3]];
    let hash = ah(u128::from_le_bytes(*irk), prand);
    hash == [bytes[2], bytes[1], bytes[0]]
}

/// Build a resolvable private address from `irk` and 24 random bits
pub fn private_address_from_prand(irk: &[u8; 16], prand: [u8; 3]) -> BdAddr {
    let mut prand_le = prand;
    prand_le[2] = (prand_le[2] & !RANDOM_ADDRESS_SUBTYPE_MASK) | RANDOM_ADDRESS_SUBTYPE_RESOLVABLE;

    let hash = ah(
        u128::from_le_bytes(*irk),
        [prand_le[2], prand_le[1], prand_le[0]],
    );
    BdAddr::new([
        hash[2],
        hash[1],
        hash[0],
        prand_le[0],
        prand_le[1],
        prand_le[2],
    ])
}

/// Generate a fresh resolvable private address for `irk`
pub fn generate_resolvable_address<R: RngCore + ?Sized>(irk: &[u8; 16], rng: &mut R) -> BdAddr {
    let mut prand = [0u8; 3];
    rng.fill_bytes(&mut prand);
    private_address_from_prand(irk, prand)
}

/// `AuthReq || OOB data flag || IO capability` as used by f6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCap(pub [u8; 3]);

impl IoCap {
    pub fn new(auth_req: u8, oob_data_flag: u8, io_capability: u8) -> Self {
        Self([auth_req, oob_data_flag, io_capability])
    }
}

/// P-256 public key with coordinates most significant octet first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl PublicKey {
    /// From the little-endian coordinates of a Pairing Public Key PDU
    pub fn from_le_bytes(x: &[u8; 32], y: &[u8; 32]) -> Self {
        let mut key = Self { x: *x, y: *y };
        key.x.reverse();
        key.y.reverse();
        key
    }

    /// Coordinates in Pairing Public Key PDU order
    pub fn to_le_bytes(&self) -> ([u8; 32], [u8; 32]) {
        let mut x = self.x;
        let mut y = self.y;
        x.reverse();
        y.reverse();
        (x, y)
    }
}

/// P-256 secret key
#[derive(Clone)]
pub struct SecretKey(NonZeroScalar);

impl SecretKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(NonZeroScalar::random(rng))
    }

    /// Secret scalar from big-endian bytes, `None` if zero or out of range
    pub fn from_be_bytes(bytes: [u8; 32]) -> Option<Self> {
        Option::<NonZeroScalar>::from(NonZeroScalar::from_repr(FieldBytes::from(bytes))).map(Self)
    }

    pub fn public_key(&self) -> PublicKey {
        let point = p256::PublicKey::from_secret_scalar(&self.0).to_encoded_point(false);
        let mut key = PublicKey {
            x: [0u8; 32],
            y: [0u8; 32],
        };
        if let (Some(x), Some(y)) = (point.x(), point.y()) {
            key.x.copy_from_slice(x);
            key.y.copy_from_slice(y);
        }
        key
    }

    /// Diffie-Hellman shared secret. `None` if the peer key is not a valid
    /// curve point or equals our own public key (Vol 3, Part H, 2.3.5.6.1).
    pub fn dh_key(&self, peer: &PublicKey) -> Option<DhKey> {
        let encoded = EncodedPoint::from_affine_coordinates(
            &FieldBytes::from(peer.x),
            &FieldBytes::from(peer.y),
            false,
        );
        let remote =
            Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&encoded))?;
        let local = p256::PublicKey::from_secret_scalar(&self.0);
        if remote == local {
            return None;
        }

        let shared = ecdh::diffie_hellman(&self.0, remote.as_affine());
        let mut key = [0u8; 32];
        key.copy_from_slice(shared.raw_secret_bytes());
        Some(DhKey(key))
    }
}

/// P-256 shared secret, most significant octet first
#[derive(Clone, PartialEq, Eq)]
pub struct DhKey(pub [u8; 32]);

impl std::fmt::Debug for DhKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhKey(..)")
    }
}

/// Correlates an asynchronous crypto request with the pairing attempt that
/// issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CryptoToken {
    pub handle: ConnectionHandle,
    pub attempt: u32,
}

/// Elliptic curve operations requested by a pairing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoRequest {
    /// Generate an ephemeral key pair for the connection
    GenerateKeyPair,
    /// Use the key pair behind the local Secure Connections OOB data for the
    /// connection
    OobKeyPair,
    /// Compute the shared secret with the connection's secret key
    ComputeDhKey(PublicKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoResponse {
    KeyPair(PublicKey),
    /// `None` if the peer key was rejected
    DhKey(Option<DhKey>),
}

/// Random source and P-256 operations
///
/// `submit` either answers immediately, or returns `None` and delivers the
/// response later through `SmpManager::crypto_complete` with the same token.
/// The ephemeral secret key stays inside the provider.
pub trait CryptoProvider {
    fn random_bytes(&mut self, out: &mut [u8]);

    fn submit(&mut self, token: CryptoToken, request: CryptoRequest) -> Option<CryptoResponse>;

    /// Forget any key material held for a connection
    fn release(&mut self, _handle: ConnectionHandle) {}

    /// Replace the key pair kept for Secure Connections OOB data. `None` if
    /// the provider cannot keep one across connections.
    fn generate_oob_key_pair(&mut self) -> Option<PublicKey> {
        None
    }

    fn random_u128(&mut self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_le_bytes(bytes)
    }
}

/// Software implementation of [`CryptoProvider`]
pub struct SoftwareCrypto<R = StdRng> {
    rng: R,
    secrets: HashMap<ConnectionHandle, SecretKey>,
    oob_secret: Option<SecretKey>,
}

impl SoftwareCrypto<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for SoftwareCrypto<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore + CryptoRng> SoftwareCrypto<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            secrets: HashMap::new(),
            oob_secret: None,
        }
    }

    /// Execute a request. Always completes synchronously.
    pub fn process(&mut self, handle: ConnectionHandle, request: CryptoRequest) -> CryptoResponse {
        match request {
            CryptoRequest::GenerateKeyPair => {
                let secret = SecretKey::random(&mut self.rng);
                let public = secret.public_key();
                trace!(
                    "Generated P-256 key pair for 0x{:04x}: X={}",
                    handle,
                    hex::encode(public.x)
                );
                self.secrets.insert(handle, secret);
                CryptoResponse::KeyPair(public)
            }
            CryptoRequest::OobKeyPair => match self.oob_secret.clone() {
                Some(secret) => {
                    let public = secret.public_key();
                    self.secrets.insert(handle, secret);
                    CryptoResponse::KeyPair(public)
                }
                None => {
                    warn!("No OOB key pair for 0x{:04x}, generating a fresh one", handle);
                    self.process(handle, CryptoRequest::GenerateKeyPair)
                }
            },
            CryptoRequest::ComputeDhKey(peer) => {
                let dh_key = self
                    .secrets
                    .get(&handle)
                    .and_then(|secret| secret.dh_key(&peer));
                if let Some(key) = &dh_key {
                    trace!("DHKey for 0x{:04x}: {}", handle, hex::encode(key.0));
                }
                CryptoResponse::DhKey(dh_key)
            }
        }
    }
}

impl<R: RngCore + CryptoRng> CryptoProvider for SoftwareCrypto<R> {
    fn random_bytes(&mut self, out: &mut [u8]) {
        self.rng.fill_bytes(out);
    }

    fn submit(&mut self, token: CryptoToken, request: CryptoRequest) -> Option<CryptoResponse> {
        Some(self.process(token.handle, request))
    }

    fn release(&mut self, handle: ConnectionHandle) {
        self.secrets.remove(&handle);
    }

    fn generate_oob_key_pair(&mut self) -> Option<PublicKey> {
        let secret = SecretKey::random(&mut self.rng);
        let public = secret.public_key();
        self.oob_secret = Some(secret);
        Some(public)
    }
}

#[cfg(test)]
#[allow(clippy::unreadable_literal)]
mod tests {
    use super::*;

    fn u256(hi: u128, lo: u128) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&hi.to_be_bytes());
        out[16..].copy_from_slice(&lo.to_be_bytes());
        out
    }

    fn sample_addresses() -> (LeAddress, LeAddress) {
        (
            LeAddress::public([0xce, 0xbf, 0x37, 0x37, 0x12, 0x56]),
            LeAddress::public([0xc1, 0xcf, 0x2d, 0x70, 0x13, 0xa7]),
        )
    }

    const N1: u128 = 0xd5cb8454_d177733e_ffffb2ec_712baeab;
    const N2: u128 = 0xa6e8e7cc_25a75f6e_216583f7_ff3dc4cf;

    #[test]
    fn test_c1_sample_data() {
        let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
        let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
        let initiator = LeAddress::random([0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1]);
        let responder = LeAddress::public([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1]);
        let r = 0x5783D521_56AD6F0E_6388274E_C6702EE0;

        let confirm = c1(0, r, &preq, &pres, &initiator, &responder);
        assert_eq!(confirm, 0x1E1E3FEF_878988EA_D2A74DC5_BEF13B86);
        assert_eq!(confirm, c1(0, r, &preq, &pres, &initiator, &responder));
        assert_ne!(confirm, c1(1, r, &preq, &pres, &initiator, &responder));
    }

    #[test]
    fn test_s1_sample_data() {
        let r1 = 0x000F0E0D_0C0B0A09_11223344_55667788;
        let r2 = 0x01020304_05060708_99AABBCC_DDEEFF00;
        assert_eq!(s1(0, r1, r2), 0x9a1fe1f0_e8b0f49b_5b4216ae_796da062);
    }

    #[test]
    fn test_f4_sample_data() {
        let u = u256(
            0x20b003d2_f297be2c_5e2c83a7_e9f9a5b9,
            0xeff49111_acf4fddb_cc030148_0e359de6,
        );
        let v = u256(
            0x55188b3d_32f6bb9a_900afcfb_eed4e72a,
            0x59cb9ac2_f19d7cfb_6b4fdd49_f47fc5fd,
        );
        assert_eq!(f4(&u, &v, N1, 0), 0xf2c916f1_07a9bd1c_f1eda1be_a974872d);
    }

    #[test]
    fn test_f5_sample_data() {
        let w = DhKey(u256(
            0xec0234a3_57c8ad05_341010a6_0a397d9b,
            0x99796b13_b4f866f1_868d34f3_73bfa698,
        ));
        let (a1, a2) = sample_addresses();
        let (mac_key, ltk) = f5(&w, N1, N2, &a1, &a2);
        assert_eq!(ltk, 0x69867911_69d7cd23_980522b5_94750a38);
        assert_eq!(mac_key, 0x2965f176_a1084a02_fd3f6a20_ce636e20);
    }

    #[test]
    fn test_f6_sample_data() {
        let (a1, a2) = sample_addresses();
        let check = f6(
            0x2965f176_a1084a02_fd3f6a20_ce636e20,
            N1,
            N2,
            0x12a3343b_b453bb54_08da42d2_0c2d0fc8,
            &IoCap::new(0x01, 0x01, 0x02),
            &a1,
            &a2,
        );
        assert_eq!(check, 0xe3c47398_9cd0e8c5_d26c0b09_da958f61);
    }

    #[test]
    fn test_g2_sample_data() {
        let u = u256(
            0x20b003d2_f297be2c_5e2c83a7_e9f9a5b9,
            0xeff49111_acf4fddb_cc030148_0e359de6,
        );
        let v = u256(
            0x55188b3d_32f6bb9a_900afcfb_eed4e72a,
            0x59cb9ac2_f19d7cfb_6b4fdd49_f47fc5fd,
        );
        assert_eq!(g2(&u, &v, N1, N2), 0x2f9ed5ba % 1_000_000);
    }

    #[test]
    fn test_sign_data_matches_cmac_example() {
        // RFC 4493 example 2, laid out as little-endian message and counter
        let csrk = [
            0x3c, 0x4f, 0xcf, 0x09, 0x88, 0x15, 0xf7, 0xab, 0xa6, 0xd2, 0xae, 0x28, 0x16, 0x15,
            0x7e, 0x2b,
        ];
        let message = [
            0x2a, 0x17, 0x93, 0x73, 0x11, 0x7e, 0x3d, 0xe9, 0x96, 0x9f, 0x40, 0x2e,
        ];
        assert_eq!(
            sign_data(&csrk, &message, 0x6bc1_bee2),
            [0x44, 0x41, 0x4d, 0x6b, 0xb4, 0x16, 0x0a, 0x07]
        );
        assert_ne!(
            sign_data(&csrk, &message, 0x6bc1_bee3),
            sign_data(&csrk, &message, 0x6bc1_bee2)
        );
    }

    #[test]
    fn test_ah_sample_data() {
        let irk = 0xec0234a3_57c8ad05_341010a6_0a397d9b;
        assert_eq!(ah(irk, [0x70, 0x81, 0x94]), [0x0d, 0xfb, 0xaa]);
    }

    #[test]
    fn test_resolve_private_address() {
        let irk = 0x8b3958c1_58ed6446_7bd27bc9_0d3cf54d_u128.to_le_bytes();
        let address = BdAddr::new([0x92, 0xF2, 0x8F, 0x84, 0x72, 0x4F]);
        assert!(resolve_private_address(&irk, &address));

        let other = [0x11u8; 16];
        assert!(!resolve_private_address(&other, &address));

        // Static random addresses never resolve
        let static_addr = BdAddr::new([0x92, 0xF2, 0x8F, 0x84, 0x72, 0xCF]);
        assert!(!resolve_private_address(&irk, &static_addr));
    }

    #[test]
    fn test_generated_address_resolves() {
        let irk = [0x42u8; 16];
        let mut rng = StdRng::seed_from_u64(7);
        let address = generate_resolvable_address(&irk, &mut rng);
        assert_eq!(address.bytes[5] & 0xC0, 0x40);
        assert!(resolve_private_address(&irk, &address));
        assert!(LeAddress::new(crate::gap::AddressType::Random, address).is_resolvable_private());
    }

    #[test]
    fn test_p256_sample_data() {
        let ska = SecretKey::from_be_bytes(u256(
            0x3f49f6d4_a3c55f38_74c9b3e3_d2103f50,
            0x4aff607b_eb40b799_5899b8a6_cd3c1abd,
        ))
        .unwrap();
        let skb = SecretKey::from_be_bytes(u256(
            0x55188b3d_32f6bb9a_900afcfb_eed4e72a,
            0x59cb9ac2_f19d7cfb_6b4fdd49_f47fc5fd,
        ))
        .unwrap();

        let pka = PublicKey {
            x: u256(
                0x20b003d2_f297be2c_5e2c83a7_e9f9a5b9,
                0xeff49111_acf4fddb_cc030148_0e359de6,
            ),
            y: u256(
                0xdc809c49_652aeb6d_63329abf_5a52155c,
                0x766345c2_8fed3024_741c8ed0_1589d28b,
            ),
        };
        let pkb = PublicKey {
            x: u256(
                0x1ea1f0f0_1faf1d96_09592284_f19e4c00,
                0x47b58afd_8615a69f_559077b2_2faaa190,
            ),
            y: u256(
                0x4c55f33e_429dad37_7356703a_9ab85160,
                0x472d1130_e28e3676_5f89aff9_15b1214a,
            ),
        };

        assert_eq!(ska.public_key(), pka);
        assert_eq!(skb.public_key(), pkb);

        let expected = DhKey(u256(
            0xec0234a3_57c8ad05_341010a6_0a397d9b,
            0x99796b13_b4f866f1_868d34f3_73bfa698,
        ));
        assert_eq!(ska.dh_key(&pkb), Some(expected.clone()));
        assert_eq!(skb.dh_key(&pka), Some(expected));
    }

    #[test]
    fn test_dh_key_rejects_bad_keys() {
        let mut rng = StdRng::seed_from_u64(1);
        let secret = SecretKey::random(&mut rng);
        let own = secret.public_key();
        assert_eq!(secret.dh_key(&own), None);

        let mut off_curve = own;
        off_curve.y[31] ^= 0x01;
        assert_eq!(secret.dh_key(&off_curve), None);
    }

    #[test]
    fn test_public_key_wire_order() {
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x[0] = 0x01;
        y[31] = 0x02;
        let key = PublicKey::from_le_bytes(&x, &y);
        assert_eq!(key.x[31], 0x01);
        assert_eq!(key.y[0], 0x02);
        assert_eq!(key.to_le_bytes(), (x, y));
    }

    #[test]
    fn test_software_crypto_key_agreement() {
        let mut alice = SoftwareCrypto::with_rng(StdRng::seed_from_u64(10));
        let mut bob = SoftwareCrypto::with_rng(StdRng::seed_from_u64(20));
        let token = CryptoToken {
            handle: 0x40,
            attempt: 1,
        };

        let pka = match alice.submit(token, CryptoRequest::GenerateKeyPair) {
            Some(CryptoResponse::KeyPair(key)) => key,
            other => panic!("unexpected response {:?}", other),
        };
        let pkb = match bob.submit(token, CryptoRequest::GenerateKeyPair) {
            Some(CryptoResponse::KeyPair(key)) => key,
            other => panic!("unexpected response {:?}", other),
        };

        let dh_a = alice.submit(token, CryptoRequest::ComputeDhKey(pkb));
        let dh_b = bob.submit(token, CryptoRequest::ComputeDhKey(pka));
        assert!(matches!(dh_a, Some(CryptoResponse::DhKey(Some(_)))));
        assert_eq!(dh_a, dh_b);

        alice.release(0x40);
        assert_eq!(
            alice.submit(token, CryptoRequest::ComputeDhKey(pkb)),
            Some(CryptoResponse::DhKey(None))
        );
    }

    #[test]
    fn test_oob_key_pair_is_reused() {
        let mut crypto = SoftwareCrypto::with_rng(StdRng::seed_from_u64(30));
        let first = CryptoToken {
            handle: 0x40,
            attempt: 1,
        };
        let second = CryptoToken {
            handle: 0x41,
            attempt: 2,
        };

        let oob = crypto.generate_oob_key_pair().unwrap();
        for token in [first, second] {
            assert_eq!(
                crypto.submit(token, CryptoRequest::OobKeyPair),
                Some(CryptoResponse::KeyPair(oob))
            );
        }
        assert_ne!(
            crypto.submit(first, CryptoRequest::GenerateKeyPair),
            Some(CryptoResponse::KeyPair(oob))
        );

        let replaced = crypto.generate_oob_key_pair().unwrap();
        assert_ne!(replaced, oob);
        assert_eq!(
            crypto.submit(second, CryptoRequest::OobKeyPair),
            Some(CryptoResponse::KeyPair(replaced))
        );
    }
}
