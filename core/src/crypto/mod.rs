// Cryptography module — keys, pairwise secrets, pad keystreams
//
// All group operations live on Ristretto255. Every participant holds a
// long-term keypair; clients additionally hold a per-session ephemeral
// keypair (the pseudonym). Pairwise client/trustee secrets come from
// Diffie-Hellman and seed one deterministic ChaCha20 keystream per peer
// pair, which is the DC-net pad source.

pub mod schnorr;
pub mod shuffle;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use zeroize::Zeroize;

/// KDF context for expanding a DH point into a pad-keystream seed.
/// Changing this breaks every existing session.
const PAD_SEED_CONTEXT: &str = "starcloak-core v1 dcnet pad seed";

/// KDF context for the per-session disruption-protection MAC key.
const DISRUPTION_MAC_CONTEXT: &str = "starcloak-core v1 disruption mac";

/// Domain separator for hashing byte strings into scalars.
const HASH_TO_SCALAR_DOMAIN: &[u8] = b"starcloak-core v1 hash-to-scalar";

/// Serialized size of a compressed Ristretto point.
pub const POINT_LENGTH: usize = 32;

/// Serialized size of a Ristretto scalar.
pub const SCALAR_LENGTH: usize = 32;

/// Compressed point bytes as they travel in protocol messages.
pub type KeyBytes = [u8; POINT_LENGTH];

/// Cryptography error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid Ristretto point encoding")]
    InvalidPoint,
    #[error("invalid scalar encoding")]
    InvalidScalar,
    #[error("signature has wrong length: {0}")]
    SignatureLength(usize),
    #[error("signature verification failed")]
    BadSignature,
    #[error("shuffle proof verification failed")]
    BadShuffleProof,
    #[error("MAC verification failed")]
    BadMac,
}

// ============================================================================
// KEYPAIRS & DIFFIE-HELLMAN
// ============================================================================

/// A Ristretto keypair. Used both for long-term identities (DH + Schnorr)
/// and for the per-session client ephemerals.
pub struct Keypair {
    secret: Scalar,
    public: RistrettoPoint,
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        let public = RistrettoPoint::mul_base(&secret);
        Keypair { secret, public }
    }

    pub fn public(&self) -> RistrettoPoint {
        self.public
    }

    pub fn public_bytes(&self) -> KeyBytes {
        self.public.compress().to_bytes()
    }

    pub(crate) fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// Diffie-Hellman against a peer's public point.
    pub fn diffie_hellman(&self, peer: &RistrettoPoint) -> RistrettoPoint {
        self.secret * peer
    }

    /// Short hex fingerprint of the public key, for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_bytes()[..8])
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Decode a compressed point received off the wire.
pub fn point_from_bytes(bytes: &KeyBytes) -> Result<RistrettoPoint, CryptoError> {
    CompressedRistretto::from_slice(bytes)
        .map_err(|_| CryptoError::InvalidPoint)?
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

pub fn point_to_bytes(point: &RistrettoPoint) -> KeyBytes {
    point.compress().to_bytes()
}

// ============================================================================
// DERIVED SECRETS & KEYSTREAMS
// ============================================================================

/// A 32-byte symmetric secret derived from a DH exchange.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Derive the pad-keystream seed shared by one client/trustee pair.
    pub fn for_pads(own: &Keypair, peer: &RistrettoPoint) -> Self {
        let dh = own.diffie_hellman(peer);
        SharedSecret(blake3::derive_key(
            PAD_SEED_CONTEXT,
            &point_to_bytes(&dh),
        ))
    }

    /// Derive the disruption-protection MAC key from a DH point that only
    /// the slot owner and the relay can both compute.
    pub fn for_disruption_mac(dh_point: &RistrettoPoint) -> Self {
        SharedSecret(blake3::derive_key(
            DISRUPTION_MAC_CONTEXT,
            &point_to_bytes(dh_point),
        ))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Deterministic keystream shared with one peer. Consumption must stay in
/// lockstep on both sides of the pair: the DC-net advances both ends by
/// exactly the cell content size each round, skipped rounds included.
pub struct PadKeystream {
    cipher: ChaCha20,
}

impl PadKeystream {
    pub fn new(secret: &SharedSecret) -> Self {
        // Fixed nonce: the key is unique per pair per session and the
        // stream is never rewound.
        let nonce = [0u8; 12];
        PadKeystream {
            cipher: ChaCha20::new(secret.as_bytes().into(), &nonce.into()),
        }
    }

    /// Produce the next `len` keystream bytes.
    pub fn next_pad(&mut self, len: usize) -> Vec<u8> {
        let mut pad = vec![0u8; len];
        self.cipher.apply_keystream(&mut pad);
        pad
    }

    /// Consume and drop `len` keystream bytes.
    pub fn skip(&mut self, len: usize) {
        let mut sink = vec![0u8; len];
        self.cipher.apply_keystream(&mut sink);
    }
}

/// One-shot keystream from a 32-byte key, used by the equivocation
/// protector to mask the owner's payload.
pub fn mask_keystream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let nonce = [0u8; 12];
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    let mut out = vec![0u8; len];
    cipher.apply_keystream(&mut out);
    out
}

// ============================================================================
// HASHING
// ============================================================================

/// Hash arbitrary bytes into a uniformly distributed scalar.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(HASH_TO_SCALAR_DOMAIN);
    hasher.update(data);
    Scalar::from_hash(hasher)
}

/// SHA-256 digest, the cell-history and upstream-hash primitive.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// ============================================================================
// DISRUPTION MAC
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over an owner cell, keyed by the per-session secret.
pub fn compute_mac(key: &SharedSecret, message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an owner cell's MAC.
pub fn verify_mac(key: &SharedSecret, message: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(tag).map_err(|_| CryptoError::BadMac)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn dh_is_symmetric() {
        let a = Keypair::generate(&mut OsRng);
        let b = Keypair::generate(&mut OsRng);

        let ab = a.diffie_hellman(&b.public());
        let ba = b.diffie_hellman(&a.public());
        assert_eq!(point_to_bytes(&ab), point_to_bytes(&ba));
    }

    #[test]
    fn pad_keystreams_agree_across_the_pair() {
        let client = Keypair::generate(&mut OsRng);
        let trustee = Keypair::generate(&mut OsRng);

        let mut ks_client = PadKeystream::new(&SharedSecret::for_pads(&client, &trustee.public()));
        let mut ks_trustee = PadKeystream::new(&SharedSecret::for_pads(&trustee, &client.public()));

        assert_eq!(ks_client.next_pad(100), ks_trustee.next_pad(100));

        // Skipping must consume exactly the same amount as producing.
        ks_client.skip(300);
        let _ = ks_trustee.next_pad(300);
        assert_eq!(ks_client.next_pad(64), ks_trustee.next_pad(64));
    }

    #[test]
    fn different_pairs_get_different_streams() {
        let client = Keypair::generate(&mut OsRng);
        let t0 = Keypair::generate(&mut OsRng);
        let t1 = Keypair::generate(&mut OsRng);

        let mut ks0 = PadKeystream::new(&SharedSecret::for_pads(&client, &t0.public()));
        let mut ks1 = PadKeystream::new(&SharedSecret::for_pads(&client, &t1.public()));
        assert_ne!(ks0.next_pad(64), ks1.next_pad(64));
    }

    #[test]
    fn point_roundtrip_and_rejection() {
        let kp = Keypair::generate(&mut OsRng);
        let bytes = kp.public_bytes();
        let point = point_from_bytes(&bytes).unwrap();
        assert_eq!(point_to_bytes(&point), bytes);

        // Not every 32-byte string is a valid encoding.
        let bad = [0xffu8; 32];
        assert!(point_from_bytes(&bad).is_err());
    }

    #[test]
    fn mac_roundtrip_and_tamper() {
        let a = Keypair::generate(&mut OsRng);
        let b = Keypair::generate(&mut OsRng);
        let key = SharedSecret::for_disruption_mac(&a.diffie_hellman(&b.public()));

        let tag = compute_mac(&key, b"cell body");
        verify_mac(&key, b"cell body", &tag).unwrap();
        assert_eq!(
            verify_mac(&key, b"cell bodY", &tag),
            Err(CryptoError::BadMac)
        );
    }

    #[test]
    fn hash_to_scalar_is_deterministic() {
        assert_eq!(hash_to_scalar(b"x"), hash_to_scalar(b"x"));
        assert_ne!(hash_to_scalar(b"x"), hash_to_scalar(b"y"));
    }
}
