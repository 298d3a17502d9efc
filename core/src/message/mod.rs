//! Protocol messages — every typed record that crosses the star
//!
//! The core defines these messages and nothing else. They are plain serde
//! records; the codec (length-prefix + bincode) lives in `codec`.

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::config::ParameterMap;
use crate::crypto::shuffle::ShuffleProof;
use crate::crypto::KeyBytes;
use crate::{ClientId, RoundId, SlotId, TrusteeId};

pub use codec::{decode_frame, encode_frame, MessageError, MAX_FRAME_SIZE};

/// Session parameters broadcast during setup. The map carries the
/// recognized configuration keys; `trustees_pks` and `relay_pk` ride
/// along once the relay knows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersMessage {
    pub params: ParameterMap,
    pub force_params: bool,
    /// Long-term trustee keys, filled in on the relay→client broadcast.
    pub trustees_pks: Vec<KeyBytes>,
    /// The relay's long-term key, needed for the disruption MAC secret.
    pub relay_pk: Option<KeyBytes>,
}

/// One downstream cell, relay to every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamCell {
    pub round_id: RoundId,
    /// Slot that owns the upcoming upstream cell, if any.
    pub ownership_id: Option<SlotId>,
    /// SHA-256 over the previous downstream payload, letting clients spot
    /// an inconsistent broadcast.
    pub hash_of_previous_upstream: [u8; 32],
    pub data: Vec<u8>,
    /// Asks clients to restart the session from IDLE.
    pub flag_resync: bool,
    /// Marks the next upstream cell as an open/closed bitmap.
    pub flag_open_closed_request: bool,
}

/// The full chained-shuffle transcript: state 0 plus the state after each
/// trustee, and one proof per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleTranscript {
    pub bases: Vec<KeyBytes>,
    pub relay_keys: Vec<KeyBytes>,
    pub key_lists: Vec<Vec<KeyBytes>>,
    pub proofs: Vec<ShuffleProof>,
}

/// Every message of the protocol, dispatched by variant in each role's
/// handler table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Setup: configuration for every role (`ALL_ALL`).
    Parameters(ParametersMessage),
    /// Terminate the receiving role (`ALL_ALL`).
    Shutdown,
    /// Trustee announces its long-term key (`TRU_REL`).
    TrusteePublicKey { trustee_id: TrusteeId, pk: KeyBytes },
    /// Client announces long-term and ephemeral keys (`CLI_REL`).
    ClientPublicKeys {
        client_id: ClientId,
        pk: KeyBytes,
        eph_pk: KeyBytes,
    },
    /// Relay hands the current shuffle state to the next trustee
    /// (`REL_TRU`). Carries the client long-term keys so the trustee can
    /// derive its pairwise pad secrets.
    ShuffleRequest {
        client_pks: Vec<KeyBytes>,
        eph_pks: Vec<KeyBytes>,
        base: KeyBytes,
        relay_key: KeyBytes,
    },
    /// One trustee's completed shuffle step (`TRU_REL`).
    ShuffleResult {
        trustee_id: TrusteeId,
        new_base: KeyBytes,
        new_relay_key: KeyBytes,
        new_eph_pks: Vec<KeyBytes>,
        proof: ShuffleProof,
    },
    /// Relay broadcasts the whole transcript for verification (`REL_TRU`).
    ShuffleTranscript(ShuffleTranscript),
    /// Trustee's signature over the final shuffle state (`TRU_REL`).
    TranscriptSignature { trustee_id: TrusteeId, sig: Vec<u8> },
    /// Relay releases the verified pseudonym schedule to clients
    /// (`REL_CLI`).
    SchedulePublished {
        base: KeyBytes,
        relay_key: KeyBytes,
        eph_pks: Vec<KeyBytes>,
        sigs: Vec<Vec<u8>>,
    },
    /// Steady state: downstream cell over the reliable path (`REL_CLI`).
    DownstreamData(DownstreamCell),
    /// Steady state: downstream cell over the broadcast path (`REL_CLI`).
    DownstreamDataUdp(DownstreamCell),
    /// Steady state: one client's upstream cipher (`CLI_REL`).
    UpstreamData {
        client_id: ClientId,
        round_id: RoundId,
        data: Vec<u8>,
    },
    /// Steady state: one client's open/closed bitmap cipher (`CLI_REL`).
    OpenClosedData {
        client_id: ClientId,
        round_id: RoundId,
        data: Vec<u8>,
    },
    /// Steady state: one trustee cipher, streamed ahead (`TRU_REL`).
    TrusteeCipher {
        trustee_id: TrusteeId,
        round_id: RoundId,
        data: Vec<u8>,
    },
    /// Relay throttles or resumes a trustee's cipher stream (`REL_TRU`).
    RateChange { window_capacity: u32 },
    /// Disruption blame phase: reveal request for one bit (`REL_ALL`).
    DisruptionReveal { round_id: RoundId, bit_pos: u32 },
}

impl ProtocolMessage {
    /// Human-readable message kind for logs and errors.
    pub fn message_type(&self) -> &'static str {
        match self {
            ProtocolMessage::Parameters(_) => "Parameters",
            ProtocolMessage::Shutdown => "Shutdown",
            ProtocolMessage::TrusteePublicKey { .. } => "TrusteePublicKey",
            ProtocolMessage::ClientPublicKeys { .. } => "ClientPublicKeys",
            ProtocolMessage::ShuffleRequest { .. } => "ShuffleRequest",
            ProtocolMessage::ShuffleResult { .. } => "ShuffleResult",
            ProtocolMessage::ShuffleTranscript(_) => "ShuffleTranscript",
            ProtocolMessage::TranscriptSignature { .. } => "TranscriptSignature",
            ProtocolMessage::SchedulePublished { .. } => "SchedulePublished",
            ProtocolMessage::DownstreamData(_) => "DownstreamData",
            ProtocolMessage::DownstreamDataUdp(_) => "DownstreamDataUdp",
            ProtocolMessage::UpstreamData { .. } => "UpstreamData",
            ProtocolMessage::OpenClosedData { .. } => "OpenClosedData",
            ProtocolMessage::TrusteeCipher { .. } => "TrusteeCipher",
            ProtocolMessage::RateChange { .. } => "RateChange",
            ProtocolMessage::DisruptionReveal { .. } => "DisruptionReveal",
        }
    }
}
