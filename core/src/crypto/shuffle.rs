// Verifiable shuffle step for the pseudonym schedule
//
// Each trustee applies a secret coefficient c to the whole shuffle state
// (generator base, shuffled relay key, every client ephemeral key) and
// permutes the key list. The attached proof lets a verifier check that
// the output really is a permutation of the scaled inputs without
// learning c or the permutation:
//
// - a Chaum-Pedersen DLEQ ties one c to the base chain and the
//   relay-key chain;
// - for every output key, a 1-of-n OR-composed DLEQ shows it equals
//   c times one (undisclosed) input key, under the same c as the base
//   chain;
// - inputs and outputs must each be pairwise distinct, so the hidden
//   input-to-output mapping is injective and therefore a permutation.

use std::collections::HashSet;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::{point_from_bytes, point_to_bytes, CryptoError, KeyBytes};

const CHAIN_DOMAIN: &[u8] = b"starcloak-core v1 shuffle chain dleq";
const MEMBER_DOMAIN: &[u8] = b"starcloak-core v1 shuffle membership";

/// The full state a shuffle step transforms.
#[derive(Clone, Debug, PartialEq)]
pub struct ShuffleState {
    /// Current base: `(Π c_j) · G` after j steps.
    pub base: RistrettoPoint,
    /// The relay's public key carried through the shuffle, `(Π c_j) · pk_R`.
    /// Lets a slot owner and the relay derive a shared secret without the
    /// relay learning which client owns the slot.
    pub relay_key: RistrettoPoint,
    /// Transformed, permuted client ephemeral keys. The index in this list
    /// is the slot id once the shuffle is final.
    pub keys: Vec<RistrettoPoint>,
}

impl ShuffleState {
    /// State before any trustee has shuffled: plain generator, the relay's
    /// own public key, and the registration-ordered client ephemerals.
    pub fn initial(relay_key: RistrettoPoint, keys: Vec<RistrettoPoint>) -> Self {
        ShuffleState {
            base: RISTRETTO_BASEPOINT_POINT,
            relay_key,
            keys,
        }
    }
}

/// DLEQ proof that one coefficient links the base and relay-key chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProof {
    pub commit_base: KeyBytes,
    pub commit_relay: KeyBytes,
    pub response: [u8; 32],
}

/// One clause of a membership proof: the (real or simulated) transcript
/// for "this output equals the coefficient times input i".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipClause {
    pub commit_base: KeyBytes,
    pub commit_key: KeyBytes,
    pub challenge: [u8; 32],
    pub response: [u8; 32],
}

/// OR-composed DLEQ over every input: exactly one clause is real, the
/// clause challenges must add up to the Fiat-Shamir challenge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipProof {
    pub clauses: Vec<MembershipClause>,
}

/// Everything a verifier needs to accept one shuffle step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleProof {
    pub chain: ChainProof,
    /// One membership proof per output key, output order.
    pub memberships: Vec<MembershipProof>,
}

fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(CryptoError::InvalidScalar)
}

fn chain_challenge(
    before: &ShuffleState,
    after: &ShuffleState,
    commits: &[KeyBytes; 2],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(CHAIN_DOMAIN);
    for point in [&before.base, &before.relay_key, &after.base, &after.relay_key] {
        hasher.update(point_to_bytes(point));
    }
    for key in before.keys.iter().chain(after.keys.iter()) {
        hasher.update(point_to_bytes(key));
    }
    for commit in commits {
        hasher.update(commit);
    }
    Scalar::from_hash(hasher)
}

fn membership_challenge(
    before: &ShuffleState,
    after: &ShuffleState,
    output: usize,
    commits: &[(KeyBytes, KeyBytes)],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(MEMBER_DOMAIN);
    hasher.update(point_to_bytes(&before.base));
    hasher.update(point_to_bytes(&after.base));
    for key in &before.keys {
        hasher.update(point_to_bytes(key));
    }
    hasher.update((output as u32).to_le_bytes());
    hasher.update(point_to_bytes(&after.keys[output]));
    for (commit_base, commit_key) in commits {
        hasher.update(commit_base);
        hasher.update(commit_key);
    }
    Scalar::from_hash(hasher)
}

fn prove_chain<R: RngCore + CryptoRng>(
    before: &ShuffleState,
    after: &ShuffleState,
    coeff: &Scalar,
    rng: &mut R,
) -> ChainProof {
    let mut nonce = Scalar::random(rng);
    let commits = [
        point_to_bytes(&(nonce * before.base)),
        point_to_bytes(&(nonce * before.relay_key)),
    ];
    let e = chain_challenge(before, after, &commits);
    let response = nonce + e * coeff;
    nonce.zeroize();
    ChainProof {
        commit_base: commits[0],
        commit_relay: commits[1],
        response: response.to_bytes(),
    }
}

/// Prove that `after.keys[output]` is `coeff * before.keys[source]`
/// without disclosing `source`: the real clause uses a fresh nonce, every
/// other clause is simulated from a random challenge/response pair.
fn prove_membership<R: RngCore + CryptoRng>(
    before: &ShuffleState,
    after: &ShuffleState,
    output: usize,
    source: usize,
    coeff: &Scalar,
    rng: &mut R,
) -> MembershipProof {
    let n = before.keys.len();
    let target = after.keys[output];
    let mut nonce = Scalar::random(rng);

    let mut challenges = vec![Scalar::ZERO; n];
    let mut responses = vec![Scalar::ZERO; n];
    let mut commits = vec![([0u8; 32], [0u8; 32]); n];

    for i in 0..n {
        if i == source {
            commits[i] = (
                point_to_bytes(&(nonce * before.base)),
                point_to_bytes(&(nonce * before.keys[i])),
            );
        } else {
            let e = Scalar::random(rng);
            let z = Scalar::random(rng);
            commits[i] = (
                point_to_bytes(&(z * before.base - e * after.base)),
                point_to_bytes(&(z * before.keys[i] - e * target)),
            );
            challenges[i] = e;
            responses[i] = z;
        }
    }

    let total = membership_challenge(before, after, output, &commits);
    let simulated_sum: Scalar = challenges.iter().sum();
    let real_challenge = total - simulated_sum;
    challenges[source] = real_challenge;
    responses[source] = nonce + real_challenge * coeff;
    nonce.zeroize();

    MembershipProof {
        clauses: (0..n)
            .map(|i| MembershipClause {
                commit_base: commits[i].0,
                commit_key: commits[i].1,
                challenge: challenges[i].to_bytes(),
                response: responses[i].to_bytes(),
            })
            .collect(),
    }
}

fn verify_membership(
    before: &ShuffleState,
    after: &ShuffleState,
    output: usize,
    proof: &MembershipProof,
) -> Result<(), CryptoError> {
    let n = before.keys.len();
    if proof.clauses.len() != n {
        return Err(CryptoError::BadShuffleProof);
    }
    let target = after.keys[output];

    let mut commits = Vec::with_capacity(n);
    let mut challenge_sum = Scalar::ZERO;
    for (i, clause) in proof.clauses.iter().enumerate() {
        let e = scalar_from_bytes(&clause.challenge)?;
        let z = scalar_from_bytes(&clause.response)?;
        let commit_base = point_from_bytes(&clause.commit_base)?;
        let commit_key = point_from_bytes(&clause.commit_key)?;

        if z * before.base != commit_base + e * after.base {
            return Err(CryptoError::BadShuffleProof);
        }
        if z * before.keys[i] != commit_key + e * target {
            return Err(CryptoError::BadShuffleProof);
        }
        challenge_sum += e;
        commits.push((clause.commit_base, clause.commit_key));
    }

    if challenge_sum != membership_challenge(before, after, output, &commits) {
        return Err(CryptoError::BadShuffleProof);
    }
    Ok(())
}

fn all_distinct(keys: &[RistrettoPoint]) -> bool {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().all(|key| seen.insert(point_to_bytes(key)))
}

/// Apply one trustee's shuffle step: scale everything by a fresh secret
/// coefficient, permute the key list uniformly, and prove the step.
pub fn shuffle_step<R: RngCore + CryptoRng>(
    before: &ShuffleState,
    rng: &mut R,
) -> (ShuffleState, ShuffleProof) {
    let mut coeff = Scalar::random(rng);

    let n = before.keys.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let keys: Vec<RistrettoPoint> = order.iter().map(|&i| coeff * before.keys[i]).collect();
    let after = ShuffleState {
        base: coeff * before.base,
        relay_key: coeff * before.relay_key,
        keys,
    };

    let chain = prove_chain(before, &after, &coeff, rng);
    let memberships = (0..n)
        .map(|output| prove_membership(before, &after, output, order[output], &coeff, rng))
        .collect();
    coeff.zeroize();

    (
        after,
        ShuffleProof {
            chain,
            memberships,
        },
    )
}

/// Verify one chained shuffle step: the accepted output is a permutation
/// of the inputs scaled by the single proven coefficient.
pub fn verify_step(
    before: &ShuffleState,
    after: &ShuffleState,
    proof: &ShuffleProof,
) -> Result<(), CryptoError> {
    let n = before.keys.len();
    if after.keys.len() != n || proof.memberships.len() != n {
        return Err(CryptoError::BadShuffleProof);
    }

    // Distinctness makes the per-output membership proofs injective: no
    // two outputs can absorb the same input.
    if !all_distinct(&before.keys) || !all_distinct(&after.keys) {
        return Err(CryptoError::BadShuffleProof);
    }

    let commits = [proof.chain.commit_base, proof.chain.commit_relay];
    let e = chain_challenge(before, after, &commits);
    let z = scalar_from_bytes(&proof.chain.response)?;
    let pairs = [
        (before.base, after.base, proof.chain.commit_base),
        (before.relay_key, after.relay_key, proof.chain.commit_relay),
    ];
    for (from, to, commit_bytes) in pairs {
        let commit = point_from_bytes(&commit_bytes)?;
        if z * from != commit + e * to {
            return Err(CryptoError::BadShuffleProof);
        }
    }

    for (output, membership) in proof.memberships.iter().enumerate() {
        verify_membership(before, after, output, membership)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use rand::rngs::OsRng;

    fn sample_state(n: usize) -> (Vec<Keypair>, ShuffleState) {
        let relay = Keypair::generate(&mut OsRng);
        let clients: Vec<Keypair> = (0..n).map(|_| Keypair::generate(&mut OsRng)).collect();
        let keys = clients.iter().map(|c| c.public()).collect();
        let state = ShuffleState::initial(relay.public(), keys);
        (clients, state)
    }

    #[test]
    fn step_verifies() {
        let (_, state) = sample_state(4);
        let (after, proof) = shuffle_step(&state, &mut OsRng);
        verify_step(&state, &after, &proof).unwrap();
    }

    #[test]
    fn single_key_step_verifies() {
        let (_, state) = sample_state(1);
        let (after, proof) = shuffle_step(&state, &mut OsRng);
        verify_step(&state, &after, &proof).unwrap();
    }

    #[test]
    fn every_client_stays_reachable() {
        // After a chain of steps, each client must find exactly one slot k
        // with keys[k] = x_i * base.
        let (clients, mut state) = sample_state(5);
        for _ in 0..3 {
            let (next, proof) = shuffle_step(&state, &mut OsRng);
            verify_step(&state, &next, &proof).unwrap();
            state = next;
        }

        let mut seen = vec![false; clients.len()];
        for client in &clients {
            let mine = client.secret() * state.base;
            let slot = state.keys.iter().position(|k| *k == mine).unwrap();
            assert!(!seen[slot], "two clients mapped to slot {slot}");
            seen[slot] = true;
        }
    }

    #[test]
    fn tampered_key_fails_verification() {
        let (_, state) = sample_state(4);
        let (mut after, proof) = shuffle_step(&state, &mut OsRng);
        after.keys[0] = Keypair::generate(&mut OsRng).public();
        assert_eq!(
            verify_step(&state, &after, &proof),
            Err(CryptoError::BadShuffleProof)
        );
    }

    #[test]
    fn sum_preserving_tampering_is_rejected() {
        // Shifting mass between two output keys keeps the key-set sum
        // intact; the per-output membership proofs still fail.
        let (_, state) = sample_state(4);
        let (mut after, proof) = shuffle_step(&state, &mut OsRng);

        let delta = Keypair::generate(&mut OsRng).public();
        after.keys[0] = after.keys[0] + delta;
        after.keys[1] = after.keys[1] - delta;

        assert_eq!(
            verify_step(&state, &after, &proof),
            Err(CryptoError::BadShuffleProof)
        );
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let (_, state) = sample_state(3);
        let (mut after, proof) = shuffle_step(&state, &mut OsRng);
        after.keys[1] = after.keys[0];
        assert_eq!(
            verify_step(&state, &after, &proof),
            Err(CryptoError::BadShuffleProof)
        );
    }

    #[test]
    fn duplicate_inputs_are_rejected() {
        let (_, mut state) = sample_state(3);
        state.keys[2] = state.keys[0];
        let (after, proof) = shuffle_step(&state, &mut OsRng);
        assert_eq!(
            verify_step(&state, &after, &proof),
            Err(CryptoError::BadShuffleProof)
        );
    }

    #[test]
    fn malformed_proof_fails_verification() {
        let (_, state) = sample_state(3);
        let (after, mut proof) = shuffle_step(&state, &mut OsRng);
        proof.chain.response = [0xAB; 32];
        assert!(verify_step(&state, &after, &proof).is_err());

        let (after, mut proof) = shuffle_step(&state, &mut OsRng);
        proof.memberships[0].clauses[0].challenge = [0xAB; 32];
        assert!(verify_step(&state, &after, &proof).is_err());
    }

    #[test]
    fn proof_does_not_transfer_to_other_states() {
        let (_, state_a) = sample_state(3);
        let (_, state_b) = sample_state(3);
        let (after_a, proof_a) = shuffle_step(&state_a, &mut OsRng);
        assert!(verify_step(&state_b, &after_a, &proof_a).is_err());
    }
}
