// Equivocation protection — binds upstream cells to downstream history
//
// Every client and the relay maintain an identical running hash over the
// downstream cells they have seen. Each upstream cell carries a scalar
// tag; the slot owner's payload is masked under a fresh blinding scalar
// folded into its tag. The relay can only strip the mask if its history
// agrees with every client's: a relay that shows different downstream
// data to different clients decodes noise.
//
// Trustee tags are history-independent because trustees stream their
// ciphers ahead of the downstream rounds; the relay applies its own
// history scalar to the trustee sum when decoding.

use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};

use crate::crypto::{hash_to_scalar, mask_keystream, sha256, CryptoError};

/// Serialized size of the per-cell tag: one Ristretto scalar.
pub const EQUIV_TAG_LENGTH: usize = 32;

/// History seed, identical for every participant before the first
/// downstream cell.
const HISTORY_SEED: &[u8] = b"init";

/// Running downstream-history state plus the tag/mask operations.
#[derive(Clone)]
pub struct EquivocationProtector {
    history: [u8; 32],
}

impl EquivocationProtector {
    pub fn new() -> Self {
        EquivocationProtector {
            history: sha256(HISTORY_SEED),
        }
    }

    /// Fold one downstream cell into the history. Must be applied in the
    /// same order at the relay and at every client.
    pub fn update_history(&mut self, cell: &[u8]) {
        let mut buf = Vec::with_capacity(self.history.len() + cell.len());
        buf.extend_from_slice(&self.history);
        buf.extend_from_slice(cell);
        self.history = sha256(&buf);
    }

    /// Current history digest (diagnostics and tests).
    pub fn history_digest(&self) -> [u8; 32] {
        self.history
    }

    fn kappa(&self) -> Scalar {
        hash_to_scalar(&self.history)
    }

    /// Sum of the per-pad scalars. Client i sums over its trustee pads,
    /// trustee j over its client pads; across the whole session the two
    /// sums cancel because every pad appears exactly once on each side.
    fn pad_scalar_sum(pads: &[Vec<u8>]) -> Scalar {
        pads.iter()
            .fold(Scalar::ZERO, |acc, pad| acc + hash_to_scalar(pad))
    }

    /// Client side: produce this cell's tag, masking `payload` in place if
    /// this client owns the slot.
    pub fn client_encrypt<R: RngCore + CryptoRng>(
        &self,
        slot_owner: bool,
        payload: &mut [u8],
        pads: &[Vec<u8>],
        rng: &mut R,
    ) -> [u8; EQUIV_TAG_LENGTH] {
        let mut tag = Self::pad_scalar_sum(pads) * self.kappa();

        if slot_owner {
            let blinding = Scalar::random(rng);
            let mask = mask_keystream(blinding.as_bytes(), payload.len());
            for (byte, m) in payload.iter_mut().zip(mask.iter()) {
                *byte ^= m;
            }
            tag += blinding;
        }

        tag.to_bytes()
    }

    /// Trustee side: the history-independent pad contribution.
    pub fn trustee_contribution(pads: &[Vec<u8>]) -> [u8; EQUIV_TAG_LENGTH] {
        Self::pad_scalar_sum(pads).to_bytes()
    }

    /// Relay side: recover the owner's blinding scalar from the collected
    /// tags and strip the mask from the XOR-combined cell.
    pub fn relay_decode(
        &self,
        xored: &mut [u8],
        trustee_tags: &[[u8; EQUIV_TAG_LENGTH]],
        client_tags: &[[u8; EQUIV_TAG_LENGTH]],
    ) -> Result<(), CryptoError> {
        let mut client_sum = Scalar::ZERO;
        for tag in client_tags {
            client_sum += decode_scalar(tag)?;
        }
        let mut trustee_sum = Scalar::ZERO;
        for tag in trustee_tags {
            trustee_sum += decode_scalar(tag)?;
        }

        let blinding = client_sum - self.kappa() * trustee_sum;
        let mask = mask_keystream(blinding.as_bytes(), xored.len());
        for (byte, m) in xored.iter_mut().zip(mask.iter()) {
            *byte ^= m;
        }
        Ok(())
    }
}

impl Default for EquivocationProtector {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_scalar(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(CryptoError::InvalidScalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand::RngCore;

    const N_CLIENTS: usize = 3;
    const N_TRUSTEES: usize = 2;
    const CELL: usize = 64;

    /// One round's pad matrix: pads[i][j] shared by client i and trustee j.
    fn pad_matrix() -> Vec<Vec<Vec<u8>>> {
        (0..N_CLIENTS)
            .map(|_| {
                (0..N_TRUSTEES)
                    .map(|_| {
                        let mut pad = vec![0u8; CELL];
                        OsRng.fill_bytes(&mut pad);
                        pad
                    })
                    .collect()
            })
            .collect()
    }

    fn run_round(
        client_history: &EquivocationProtector,
        relay_history: &EquivocationProtector,
        payload: &[u8],
    ) -> Vec<u8> {
        let pads = pad_matrix();

        let mut xored = vec![0u8; CELL];
        let mut client_tags = Vec::new();
        let mut trustee_tags = Vec::new();

        for (i, client_pads) in pads.iter().enumerate() {
            let owner = i == 0;
            let mut cell = if owner {
                payload.to_vec()
            } else {
                vec![0u8; CELL]
            };
            let tag = client_history.client_encrypt(owner, &mut cell, client_pads, &mut OsRng);
            client_tags.push(tag);
            for pad in client_pads {
                for (byte, p) in cell.iter_mut().zip(pad.iter()) {
                    *byte ^= p;
                }
            }
            for (acc, byte) in xored.iter_mut().zip(cell.iter()) {
                *acc ^= byte;
            }
        }

        for j in 0..N_TRUSTEES {
            let trustee_pads: Vec<Vec<u8>> = (0..N_CLIENTS).map(|i| pads[i][j].clone()).collect();
            trustee_tags.push(EquivocationProtector::trustee_contribution(&trustee_pads));
            let mut cell = vec![0u8; CELL];
            for pad in &trustee_pads {
                for (byte, p) in cell.iter_mut().zip(pad.iter()) {
                    *byte ^= p;
                }
            }
            for (acc, byte) in xored.iter_mut().zip(cell.iter()) {
                *acc ^= byte;
            }
        }

        relay_history
            .relay_decode(&mut xored, &trustee_tags, &client_tags)
            .unwrap();
        xored
    }

    #[test]
    fn honest_relay_recovers_payload() {
        let mut clients = EquivocationProtector::new();
        let mut relay = EquivocationProtector::new();
        clients.update_history(b"downstream-1");
        relay.update_history(b"downstream-1");

        let payload = vec![0x42u8; CELL];
        assert_eq!(run_round(&clients, &relay, &payload), payload);
    }

    #[test]
    fn equivocating_relay_decodes_noise() {
        let mut clients = EquivocationProtector::new();
        let mut relay = EquivocationProtector::new();
        clients.update_history(b"what the clients saw");
        relay.update_history(b"what the relay claims");

        let payload = vec![0x42u8; CELL];
        assert_ne!(run_round(&clients, &relay, &payload), payload);
    }

    #[test]
    fn history_updates_commute_identically() {
        let mut a = EquivocationProtector::new();
        let mut b = EquivocationProtector::new();
        for cell in [b"one".as_slice(), b"two", b"three"] {
            a.update_history(cell);
            b.update_history(cell);
        }
        assert_eq!(a.history_digest(), b.history_digest());

        b.update_history(b"four");
        assert_ne!(a.history_digest(), b.history_digest());
    }
}
