// DC-net entity — per-round cell encoding and XOR decoding
//
// Clients and trustees each hold one deterministic keystream per peer
// pair. A round's cell is the XOR of every pad with (for the slot owner)
// the payload; XOR-combining all N+M cells at the relay cancels every pad
// and leaves the owner's plaintext. The entity owns the round counter and
// keeps keystream consumption in lockstep: skipped rounds consume exactly
// one content-size of keystream per peer.

pub mod equivocation;

use rand::rngs::OsRng;
use thiserror::Error;
use tracing::trace;

use crate::crypto::{compute_mac, CryptoError, PadKeystream, SharedSecret};
use crate::RoundId;
pub use equivocation::{EquivocationProtector, EQUIV_TAG_LENGTH};

/// Bytes reserved at the head of the content for the disruption MAC.
pub const DISRUPTION_MAC_LENGTH: usize = 32;

/// One byte after the MAC carries the `b_echo_last` retransmit request.
pub const ECHO_FLAG_LENGTH: usize = 1;

/// Which side of the DC-net this entity plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcNetRole {
    Client,
    Trustee,
    Relay,
}

/// DC-net error types
#[derive(Debug, Error)]
pub enum DcNetError {
    #[error("cell sizes leave no room for content (message {message}, overhead {overhead})")]
    ContentSizeTooSmall { message: usize, overhead: usize },
    #[error("cannot encode for past round {requested}, entity is at round {current}")]
    RoundInPast { requested: RoundId, current: RoundId },
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("no round decode in progress")]
    DecoderIdle,
    #[error("decoding round {decoding}, got cipher for round {requested}")]
    DecoderRoundMismatch { requested: RoundId, decoding: RoundId },
    #[error("cell has {len} bytes, expected {expected}")]
    BadCellLength { len: usize, expected: usize },
    #[error("operation not valid for this DC-net role")]
    WrongRole,
    #[error("slot owner has no disruption MAC key")]
    MissingMacKey,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ============================================================================
// CELL WIRE FORM
// ============================================================================

/// One DC-net cell as it travels to the relay: the XORed content plus the
/// optional equivocation tag at the tail.
#[derive(Debug, Clone)]
pub struct DcNetCell {
    pub content: Vec<u8>,
    pub tag: Option<[u8; EQUIV_TAG_LENGTH]>,
}

impl DcNetCell {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.content.clone();
        if let Some(tag) = &self.tag {
            out.extend_from_slice(tag);
        }
        out
    }

    pub fn from_bytes(
        bytes: &[u8],
        content_size: usize,
        with_tag: bool,
    ) -> Result<Self, DcNetError> {
        let expected = content_size + if with_tag { EQUIV_TAG_LENGTH } else { 0 };
        if bytes.len() != expected {
            return Err(DcNetError::BadCellLength {
                len: bytes.len(),
                expected,
            });
        }
        let tag = if with_tag {
            let mut tag = [0u8; EQUIV_TAG_LENGTH];
            tag.copy_from_slice(&bytes[content_size..]);
            Some(tag)
        } else {
            None
        };
        Ok(DcNetCell {
            content: bytes[..content_size].to_vec(),
            tag,
        })
    }
}

/// Disruption-protection view of a decoded content: MAC, echo flag, data.
#[derive(Debug, Clone, Copy)]
pub struct DisruptionContent<'a> {
    pub mac: &'a [u8],
    pub echo_last: bool,
    pub data: &'a [u8],
}

/// Split a decoded content into its disruption-protection parts.
pub fn split_disruption_content(content: &[u8]) -> Result<DisruptionContent<'_>, DcNetError> {
    let header = DISRUPTION_MAC_LENGTH + ECHO_FLAG_LENGTH;
    if content.len() <= header {
        return Err(DcNetError::BadCellLength {
            len: content.len(),
            expected: header + 1,
        });
    }
    Ok(DisruptionContent {
        mac: &content[..DISRUPTION_MAC_LENGTH],
        echo_last: content[DISRUPTION_MAC_LENGTH] == 1,
        data: &content[header..],
    })
}

// ============================================================================
// ROUND DECODER (relay)
// ============================================================================

struct RoundDecoder {
    round: RoundId,
    xor_buffer: Vec<u8>,
    client_tags: Vec<[u8; EQUIV_TAG_LENGTH]>,
    trustee_tags: Vec<[u8; EQUIV_TAG_LENGTH]>,
}

/// Result of finalizing a round at the relay.
pub struct DecodedCell {
    /// The content after equivocation unmasking (disruption header, if any,
    /// still attached).
    pub plaintext: Vec<u8>,
    /// The raw XOR combination before unmasking.
    pub ciphertext: Vec<u8>,
}

// ============================================================================
// ENTITY
// ============================================================================

/// Per-participant DC-net state: keystreams, round counter, optional
/// equivocation protector, and (at the relay) the round decoder.
pub struct DcNetEntity {
    entity_id: u16,
    role: DcNetRole,
    message_size: usize,
    content_size: usize,
    disruption_enabled: bool,
    disruption_mac_key: Option<SharedSecret>,
    equivocation: Option<EquivocationProtector>,
    keystreams: Vec<PadKeystream>,
    current_round: RoundId,
    decoder: Option<RoundDecoder>,
}

impl DcNetEntity {
    /// Build an entity. `shared_secrets` is the peer-ordered list of
    /// pairwise secrets (trustee order at a client, client order at a
    /// trustee, empty at the relay). `disruption_mac_key` is the session
    /// secret a client uses to authenticate cells it owns.
    pub fn new(
        entity_id: u16,
        role: DcNetRole,
        payload_size: usize,
        equivocation_protection: bool,
        disruption_protection: bool,
        shared_secrets: Vec<SharedSecret>,
        disruption_mac_key: Option<SharedSecret>,
    ) -> Result<Self, DcNetError> {
        let message_size = payload_size;
        let tag_len = if equivocation_protection {
            EQUIV_TAG_LENGTH
        } else {
            0
        };
        let disruption_overhead = if disruption_protection {
            DISRUPTION_MAC_LENGTH + ECHO_FLAG_LENGTH
        } else {
            0
        };
        if message_size <= tag_len + disruption_overhead {
            return Err(DcNetError::ContentSizeTooSmall {
                message: message_size,
                overhead: tag_len + disruption_overhead,
            });
        }

        let keystreams = match role {
            DcNetRole::Relay => Vec::new(),
            _ => shared_secrets.iter().map(PadKeystream::new).collect(),
        };

        Ok(DcNetEntity {
            entity_id,
            role,
            message_size,
            content_size: message_size - tag_len,
            disruption_enabled: disruption_protection,
            disruption_mac_key,
            equivocation: equivocation_protection.then(EquivocationProtector::new),
            keystreams,
            current_round: 0,
            decoder: None,
        })
    }

    pub fn entity_id(&self) -> u16 {
        self.entity_id
    }

    pub fn current_round(&self) -> RoundId {
        self.current_round
    }

    /// Full cell size on the wire.
    pub fn message_size(&self) -> usize {
        self.message_size
    }

    /// Content bytes under the equivocation tag.
    pub fn content_size(&self) -> usize {
        self.content_size
    }

    /// How much a slot owner can embed per cell.
    pub fn owner_payload_size(&self) -> usize {
        if self.disruption_enabled {
            self.content_size - DISRUPTION_MAC_LENGTH - ECHO_FLAG_LENGTH
        } else {
            self.content_size
        }
    }

    /// Fold a downstream cell into the equivocation history. No-op when
    /// equivocation protection is off.
    pub fn update_history(&mut self, cell: &[u8]) {
        if let Some(protector) = &mut self.equivocation {
            protector.update_history(cell);
        }
    }

    // ------------------------------------------------------------------------
    // ENCODING (clients, trustees)
    // ------------------------------------------------------------------------

    /// Encode one cell. Skipped rounds consume keystream; encoding for a
    /// past round is a protocol error. `payload` is `Some` for the slot
    /// owner's data and for scheduling-bitmap contributions; everyone else
    /// passes `None`.
    pub fn encode_for_round(
        &mut self,
        round_id: RoundId,
        slot_owner: bool,
        payload: Option<&[u8]>,
        echo_last: bool,
    ) -> Result<Vec<u8>, DcNetError> {
        if self.role == DcNetRole::Relay {
            return Err(DcNetError::WrongRole);
        }
        if round_id < self.current_round {
            return Err(DcNetError::RoundInPast {
                requested: round_id,
                current: self.current_round,
            });
        }

        while self.current_round < round_id {
            trace!(round = self.current_round, "discarding keystream for skipped round");
            for ks in &mut self.keystreams {
                ks.skip(self.content_size);
            }
            self.current_round += 1;
        }

        let cell = match self.role {
            DcNetRole::Client => self.client_encode(slot_owner, payload, echo_last)?,
            DcNetRole::Trustee => {
                if slot_owner || payload.is_some() {
                    return Err(DcNetError::WrongRole);
                }
                self.trustee_encode()
            }
            DcNetRole::Relay => unreachable!(),
        };

        self.current_round = round_id + 1;
        Ok(cell.to_bytes())
    }

    fn client_encode(
        &mut self,
        slot_owner: bool,
        payload: Option<&[u8]>,
        echo_last: bool,
    ) -> Result<DcNetCell, DcNetError> {
        let mut content = vec![0u8; self.content_size];

        match payload {
            Some(data) if slot_owner && self.disruption_enabled => {
                if data.len() > self.owner_payload_size() {
                    return Err(DcNetError::PayloadTooLong {
                        len: data.len(),
                        max: self.owner_payload_size(),
                    });
                }
                let key = self
                    .disruption_mac_key
                    .as_ref()
                    .ok_or(DcNetError::MissingMacKey)?;
                let header = DISRUPTION_MAC_LENGTH + ECHO_FLAG_LENGTH;
                content[DISRUPTION_MAC_LENGTH] = u8::from(echo_last);
                content[header..header + data.len()].copy_from_slice(data);
                let mac = compute_mac(key, &content[DISRUPTION_MAC_LENGTH..]);
                content[..DISRUPTION_MAC_LENGTH].copy_from_slice(&mac);
            }
            Some(data) => {
                // Owner data without disruption, or a scheduling bitmap.
                if data.len() > self.content_size {
                    return Err(DcNetError::PayloadTooLong {
                        len: data.len(),
                        max: self.content_size,
                    });
                }
                content[..data.len()].copy_from_slice(data);
            }
            None => {}
        }

        let pads: Vec<Vec<u8>> = self
            .keystreams
            .iter_mut()
            .map(|ks| ks.next_pad(self.content_size))
            .collect();

        let tag = self.equivocation.as_ref().map(|protector| {
            protector.client_encrypt(slot_owner, &mut content, &pads, &mut OsRng)
        });

        for pad in &pads {
            for (byte, p) in content.iter_mut().zip(pad.iter()) {
                *byte ^= p;
            }
        }

        Ok(DcNetCell { content, tag })
    }

    fn trustee_encode(&mut self) -> DcNetCell {
        let mut content = vec![0u8; self.content_size];

        let pads: Vec<Vec<u8>> = self
            .keystreams
            .iter_mut()
            .map(|ks| ks.next_pad(self.content_size))
            .collect();

        for pad in &pads {
            for (byte, p) in content.iter_mut().zip(pad.iter()) {
                *byte ^= p;
            }
        }

        let tag = self
            .equivocation
            .as_ref()
            .map(|_| EquivocationProtector::trustee_contribution(&pads));

        DcNetCell { content, tag }
    }

    // ------------------------------------------------------------------------
    // DECODING (relay)
    // ------------------------------------------------------------------------

    /// Initialize the accumulator for a round.
    pub fn decode_start(&mut self, round_id: RoundId) {
        self.decoder = Some(RoundDecoder {
            round: round_id,
            xor_buffer: vec![0u8; self.content_size],
            client_tags: Vec::new(),
            trustee_tags: Vec::new(),
        });
    }

    /// XOR a client cipher into the round accumulator.
    pub fn decode_client(&mut self, round_id: RoundId, bytes: &[u8]) -> Result<(), DcNetError> {
        let cell = DcNetCell::from_bytes(bytes, self.content_size, self.equivocation.is_some())?;
        self.accumulate(round_id, cell, true)
    }

    /// XOR a trustee cipher into the round accumulator.
    pub fn decode_trustee(&mut self, round_id: RoundId, bytes: &[u8]) -> Result<(), DcNetError> {
        let cell = DcNetCell::from_bytes(bytes, self.content_size, self.equivocation.is_some())?;
        self.accumulate(round_id, cell, false)
    }

    fn accumulate(
        &mut self,
        round_id: RoundId,
        cell: DcNetCell,
        from_client: bool,
    ) -> Result<(), DcNetError> {
        let decoder = self.decoder.as_mut().ok_or(DcNetError::DecoderIdle)?;
        if round_id != decoder.round {
            return Err(DcNetError::DecoderRoundMismatch {
                requested: round_id,
                decoding: decoder.round,
            });
        }

        for (acc, byte) in decoder.xor_buffer.iter_mut().zip(cell.content.iter()) {
            *acc ^= byte;
        }
        if let Some(tag) = cell.tag {
            if from_client {
                decoder.client_tags.push(tag);
            } else {
                decoder.trustee_tags.push(tag);
            }
        }
        Ok(())
    }

    /// Finalize the round being decoded. Scheduling cells skip the
    /// equivocation unmasking: they have no single owner and no blinding.
    pub fn decode_cell(&mut self, is_scheduling_cell: bool) -> Result<DecodedCell, DcNetError> {
        let decoder = self.decoder.take().ok_or(DcNetError::DecoderIdle)?;
        let ciphertext = decoder.xor_buffer.clone();

        let mut plaintext = decoder.xor_buffer;
        if let Some(protector) = &self.equivocation {
            if !is_scheduling_cell {
                protector.relay_decode(
                    &mut plaintext,
                    &decoder.trustee_tags,
                    &decoder.client_tags,
                )?;
            }
        }

        Ok(DecodedCell {
            plaintext,
            ciphertext,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
