//! Neff-shuffle coordinator — pseudonym slots from a chained shuffle
//!
//! The relay drives a chain: each trustee in turn scales the shuffle
//! state by a secret coefficient, permutes the client ephemeral keys and
//! proves the step. The relay then broadcasts the whole transcript;
//! every trustee re-verifies each step, checks that its own permutation
//! appears unchanged, and signs the final state. Clients verify the
//! signatures and locate their own key in the permuted list — its index
//! is their slot id for the session.

pub mod slots;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::shuffle::{shuffle_step, verify_step, ShuffleProof, ShuffleState};
use crate::crypto::{point_from_bytes, point_to_bytes, schnorr, CryptoError, KeyBytes, Keypair};
use crate::message::ShuffleTranscript;
use crate::{SlotId, TrusteeId};

/// Shuffle coordination error types
#[derive(Debug, Error)]
pub enum ShuffleError {
    #[error("shuffle chain already complete")]
    AlreadyDone,
    #[error("shuffle chain not complete yet")]
    NotDone,
    #[error("trustee has not shuffled yet")]
    NoOwnStep,
    #[error("malformed transcript: {0}")]
    MalformedTranscript(&'static str),
    #[error("own permutation missing from the transcript")]
    OwnStepMissing,
    #[error("invalid signature from trustee {0}")]
    BadTrusteeSignature(TrusteeId),
    #[error("duplicate signature from trustee {0}")]
    DuplicateSignature(TrusteeId),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The blob every trustee signs: final base, final relay key, final keys.
fn signed_blob(state: &ShuffleState) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 * (2 + state.keys.len()));
    blob.extend_from_slice(&point_to_bytes(&state.base));
    blob.extend_from_slice(&point_to_bytes(&state.relay_key));
    for key in &state.keys {
        blob.extend_from_slice(&point_to_bytes(key));
    }
    blob
}

fn state_from_parts(
    base: &KeyBytes,
    relay_key: &KeyBytes,
    keys: &[KeyBytes],
) -> Result<ShuffleState, CryptoError> {
    Ok(ShuffleState {
        base: point_from_bytes(base)?,
        relay_key: point_from_bytes(relay_key)?,
        keys: keys
            .iter()
            .map(point_from_bytes)
            .collect::<Result<Vec<_>, _>>()?,
    })
}

// ============================================================================
// RELAY VIEW
// ============================================================================

/// The relay's side of the chained shuffle.
pub struct RelayShuffleView {
    n_trustees: usize,
    states: Vec<ShuffleState>,
    proofs: Vec<ShuffleProof>,
    signatures: Vec<Option<Vec<u8>>>,
    n_signatures: usize,
}

impl RelayShuffleView {
    /// Start the chain from the identity state: plain generator, the
    /// relay's own key, registration-ordered ephemerals.
    pub fn new(
        n_trustees: usize,
        relay_key: RistrettoPoint,
        eph_pks: Vec<RistrettoPoint>,
    ) -> Self {
        RelayShuffleView {
            n_trustees,
            states: vec![ShuffleState::initial(relay_key, eph_pks)],
            proofs: Vec::new(),
            signatures: vec![None; n_trustees],
            n_signatures: 0,
        }
    }

    /// Which trustee should shuffle next.
    pub fn next_trustee(&self) -> Result<TrusteeId, ShuffleError> {
        if self.proofs.len() >= self.n_trustees {
            return Err(ShuffleError::AlreadyDone);
        }
        Ok(self.proofs.len() as TrusteeId)
    }

    /// The state to hand to the next trustee.
    pub fn current_parts(&self) -> (KeyBytes, KeyBytes, Vec<KeyBytes>) {
        let state = self.states.last().expect("chain starts non-empty");
        (
            point_to_bytes(&state.base),
            point_to_bytes(&state.relay_key),
            state.keys.iter().map(point_to_bytes).collect(),
        )
    }

    /// Fold in one trustee's step, verifying the proof before accepting.
    /// Returns true when every trustee has shuffled.
    pub fn receive_step(
        &mut self,
        new_base: &KeyBytes,
        new_relay_key: &KeyBytes,
        new_keys: &[KeyBytes],
        proof: ShuffleProof,
    ) -> Result<bool, ShuffleError> {
        if self.proofs.len() >= self.n_trustees {
            return Err(ShuffleError::AlreadyDone);
        }
        let after = state_from_parts(new_base, new_relay_key, new_keys)?;
        let before = self.states.last().expect("chain starts non-empty");
        verify_step(before, &after, &proof)?;

        debug!(step = self.proofs.len(), "shuffle step accepted");
        self.states.push(after);
        self.proofs.push(proof);
        Ok(self.proofs.len() == self.n_trustees)
    }

    /// The transcript broadcast to every trustee for verification.
    pub fn transcript(&self) -> Result<ShuffleTranscript, ShuffleError> {
        if self.proofs.len() < self.n_trustees {
            return Err(ShuffleError::NotDone);
        }
        Ok(ShuffleTranscript {
            bases: self.states.iter().map(|s| point_to_bytes(&s.base)).collect(),
            relay_keys: self
                .states
                .iter()
                .map(|s| point_to_bytes(&s.relay_key))
                .collect(),
            key_lists: self
                .states
                .iter()
                .map(|s| s.keys.iter().map(point_to_bytes).collect())
                .collect(),
            proofs: self.proofs.clone(),
        })
    }

    pub fn final_state(&self) -> Result<&ShuffleState, ShuffleError> {
        if self.proofs.len() < self.n_trustees {
            return Err(ShuffleError::NotDone);
        }
        Ok(self.states.last().expect("chain starts non-empty"))
    }

    /// Verify and store one trustee's transcript signature. Returns true
    /// once all are in.
    pub fn receive_signature(
        &mut self,
        trustee_id: TrusteeId,
        signature: Vec<u8>,
        trustee_pk: &RistrettoPoint,
    ) -> Result<bool, ShuffleError> {
        let blob = signed_blob(self.final_state()?);
        let slot = self
            .signatures
            .get_mut(trustee_id as usize)
            .ok_or(ShuffleError::BadTrusteeSignature(trustee_id))?;
        if slot.is_some() {
            return Err(ShuffleError::DuplicateSignature(trustee_id));
        }
        if schnorr::verify(trustee_pk, &blob, &signature).is_err() {
            warn!(trustee = trustee_id, "transcript signature rejected");
            return Err(ShuffleError::BadTrusteeSignature(trustee_id));
        }

        *slot = Some(signature);
        self.n_signatures += 1;
        debug!(
            trustee = trustee_id,
            collected = self.n_signatures,
            "transcript signature accepted"
        );
        Ok(self.n_signatures == self.n_trustees)
    }

    /// All signatures, trustee order, once complete.
    pub fn signatures(&self) -> Result<Vec<Vec<u8>>, ShuffleError> {
        if self.n_signatures < self.n_trustees {
            return Err(ShuffleError::NotDone);
        }
        Ok(self
            .signatures
            .iter()
            .map(|s| s.clone().expect("counted complete"))
            .collect())
    }
}

// ============================================================================
// TRUSTEE VIEW
// ============================================================================

/// One trustee's side: perform its step, later verify the transcript and
/// sign.
pub struct TrusteeShuffleView {
    trustee_id: TrusteeId,
    own_after: Option<ShuffleState>,
    own_proof: Option<ShuffleProof>,
}

impl TrusteeShuffleView {
    pub fn new(trustee_id: TrusteeId) -> Self {
        TrusteeShuffleView {
            trustee_id,
            own_after: None,
            own_proof: None,
        }
    }

    /// Shuffle the received state, remembering the output for the later
    /// own-permutation check.
    pub fn perform_step<R: RngCore + CryptoRng>(
        &mut self,
        base: &KeyBytes,
        relay_key: &KeyBytes,
        eph_pks: &[KeyBytes],
        rng: &mut R,
    ) -> Result<(KeyBytes, KeyBytes, Vec<KeyBytes>, ShuffleProof), ShuffleError> {
        let before = state_from_parts(base, relay_key, eph_pks)?;
        let (after, proof) = shuffle_step(&before, rng);

        let parts = (
            point_to_bytes(&after.base),
            point_to_bytes(&after.relay_key),
            after.keys.iter().map(point_to_bytes).collect(),
            proof.clone(),
        );
        self.own_after = Some(after);
        self.own_proof = Some(proof);
        info!(trustee = self.trustee_id, "shuffle step performed");
        Ok(parts)
    }

    /// Verify every chained step of the transcript, check that this
    /// trustee's own step appears unchanged, and sign the final state.
    pub fn verify_transcript_and_sign<R: RngCore + CryptoRng>(
        &self,
        transcript: &ShuffleTranscript,
        keypair: &Keypair,
        rng: &mut R,
    ) -> Result<Vec<u8>, ShuffleError> {
        let own_after = self.own_after.as_ref().ok_or(ShuffleError::NoOwnStep)?;
        let own_proof = self.own_proof.as_ref().ok_or(ShuffleError::NoOwnStep)?;

        let n_states = transcript.bases.len();
        if n_states < 2 {
            return Err(ShuffleError::MalformedTranscript("too few states"));
        }
        if transcript.relay_keys.len() != n_states
            || transcript.key_lists.len() != n_states
            || transcript.proofs.len() != n_states - 1
        {
            return Err(ShuffleError::MalformedTranscript("length mismatch"));
        }

        let states: Vec<ShuffleState> = (0..n_states)
            .map(|i| {
                state_from_parts(
                    &transcript.bases[i],
                    &transcript.relay_keys[i],
                    &transcript.key_lists[i],
                )
            })
            .collect::<Result<_, _>>()?;

        for (i, proof) in transcript.proofs.iter().enumerate() {
            verify_step(&states[i], &states[i + 1], proof)?;
        }

        let own_found = states
            .iter()
            .skip(1)
            .zip(transcript.proofs.iter())
            .any(|(state, proof)| state == own_after && proof == own_proof);
        if !own_found {
            return Err(ShuffleError::OwnStepMissing);
        }

        let blob = signed_blob(states.last().expect("checked non-empty"));
        info!(trustee = self.trustee_id, "transcript verified, signing");
        Ok(schnorr::sign(keypair, &blob, rng).to_vec())
    }
}

// ============================================================================
// CLIENT-SIDE VERIFICATION
// ============================================================================

/// Verify the trustee signatures over a published schedule.
pub fn verify_schedule(
    base: &KeyBytes,
    relay_key: &KeyBytes,
    eph_pks: &[KeyBytes],
    signatures: &[Vec<u8>],
    trustee_pks: &[RistrettoPoint],
) -> Result<(), ShuffleError> {
    if signatures.len() != trustee_pks.len() {
        return Err(ShuffleError::MalformedTranscript("signature count"));
    }
    let state = state_from_parts(base, relay_key, eph_pks)?;
    let blob = signed_blob(&state);
    for (j, (sig, pk)) in signatures.iter().zip(trustee_pks.iter()).enumerate() {
        schnorr::verify(pk, &blob, sig)
            .map_err(|_| ShuffleError::BadTrusteeSignature(j as TrusteeId))?;
    }
    Ok(())
}

/// Locate this client's slot: the position k with `keys[k] = x · base`.
pub fn find_own_slot(
    base: &KeyBytes,
    eph_pks: &[KeyBytes],
    eph_secret: &Scalar,
) -> Result<Option<SlotId>, CryptoError> {
    let base_point = point_from_bytes(base)?;
    let mine = point_to_bytes(&(eph_secret * base_point));
    Ok(eph_pks
        .iter()
        .position(|pk| *pk == mine)
        .map(|k| k as SlotId))
}

// ============================================================================
// TESTS
// ============================================================================
