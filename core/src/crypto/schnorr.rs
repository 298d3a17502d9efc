// Schnorr signatures over Ristretto255
//
// Used by trustees to sign the final shuffle transcript with their
// long-term keys, and by everyone to verify those signatures.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::{CryptoError, Keypair};

/// Serialized signature size: compressed nonce point followed by the
/// response scalar.
pub const SIGNATURE_LENGTH: usize = 64;

const CHALLENGE_DOMAIN: &[u8] = b"starcloak-core v1 schnorr";

fn challenge(nonce: &CompressedRistretto, public: &RistrettoPoint, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_DOMAIN);
    hasher.update(nonce.as_bytes());
    hasher.update(public.compress().as_bytes());
    hasher.update(message);
    Scalar::from_hash(hasher)
}

/// Sign `message` with a long-term keypair.
pub fn sign<R: RngCore + CryptoRng>(
    keypair: &Keypair,
    message: &[u8],
    rng: &mut R,
) -> [u8; SIGNATURE_LENGTH] {
    let mut nonce = Scalar::random(rng);
    let commitment = RistrettoPoint::mul_base(&nonce).compress();

    let e = challenge(&commitment, &keypair.public(), message);
    let response = nonce + e * keypair.secret();
    nonce.zeroize();

    let mut out = [0u8; SIGNATURE_LENGTH];
    out[..32].copy_from_slice(commitment.as_bytes());
    out[32..].copy_from_slice(response.as_bytes());
    out
}

/// Verify a signature against the signer's public key.
pub fn verify(
    public: &RistrettoPoint,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(CryptoError::SignatureLength(signature.len()));
    }

    let commitment = CompressedRistretto::from_slice(&signature[..32])
        .map_err(|_| CryptoError::InvalidPoint)?;
    let commitment_point = commitment.decompress().ok_or(CryptoError::InvalidPoint)?;

    let response_bytes: [u8; 32] = signature[32..]
        .try_into()
        .map_err(|_| CryptoError::InvalidScalar)?;
    let response = Option::<Scalar>::from(Scalar::from_canonical_bytes(response_bytes))
        .ok_or(CryptoError::InvalidScalar)?;

    let e = challenge(&commitment, public, message);
    if RistrettoPoint::mul_base(&response) == commitment_point + e * public {
        Ok(())
    } else {
        Err(CryptoError::BadSignature)
    }
}
