//! Client role — anonymized upstream, verified downstream
//!
//! A client registers its keys, learns its pseudonym slot from the
//! verified shuffle, then answers every downstream cell with exactly one
//! upstream cipher: payload when it owns the slot, an open/closed bitmap
//! when asked, padding noise otherwise. It checks every downstream
//! against the relay's claimed hash of the previous cell and requests an
//! echo when the broadcast looks inconsistent.

use std::collections::{BTreeMap, VecDeque};

use curve25519_dalek::ristretto::RistrettoPoint;
use rand::rngs::OsRng;
use tracing::{debug, error, info, warn};

use crate::config::{keys, SessionConfig};
use crate::crypto::{point_from_bytes, sha256, Keypair, SharedSecret};
use crate::dcnet::{DcNetEntity, DcNetRole};
use crate::message::{DownstreamCell, ParametersMessage, ProtocolMessage};
use crate::scheduler::slots::owner_contribution;
use crate::scheduler::{find_own_slot, verify_schedule};
use crate::statemachine::{RoleState, StateMachine};
use crate::transport::MessageSender;
use crate::{ClientId, CoreError, RoundId, SlotId};

/// The client's session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    EphKeysSent,
    ShuffleReceived,
    Communicating,
    Shutdown,
}

impl RoleState for ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Idle => "IDLE",
            ClientState::EphKeysSent => "EPH_KEYS_SENT",
            ClientState::ShuffleReceived => "SHUFFLE_RECEIVED",
            ClientState::Communicating => "COMMUNICATING",
            ClientState::Shutdown => "SHUTDOWN",
        }
    }

    fn can_transition(&self, to: &Self) -> bool {
        use ClientState::*;
        matches!(
            (self, to),
            (Idle, EphKeysSent)
                | (EphKeysSent, ShuffleReceived)
                | (ShuffleReceived, Communicating)
                | (_, Idle)
                | (_, Shutdown)
        )
    }
}

pub struct ClientRole<S: MessageSender> {
    sender: S,
    client_id: ClientId,
    keypair: Keypair,
    ephemeral: Option<Keypair>,
    config: SessionConfig,
    state: StateMachine<ClientState>,

    trustee_pks: Vec<RistrettoPoint>,
    relay_pk: Option<RistrettoPoint>,
    slot: Option<SlotId>,
    dcnet: Option<DcNetEntity>,

    /// Bytes queued by the host for anonymous upstream transmission.
    outbound: VecDeque<u8>,
    /// Downstream payloads delivered to the host.
    delivered: VecDeque<Vec<u8>>,

    last_downstream_hash: Option<[u8; 32]>,
    /// Set on a hash mismatch; rides out with the next owned cell.
    echo_request_pending: bool,
    /// Round whose echo retransmission we are waiting for.
    awaiting_echo_of: Option<RoundId>,
    /// What we encoded in rounds we owned, padded, for echo comparison.
    sent_history: BTreeMap<RoundId, Vec<u8>>,
    /// Disruption found by comparing an echo: (round, bit position).
    pending_blame: Option<(RoundId, u32)>,
}

impl<S: MessageSender> ClientRole<S> {
    pub fn new(client_id: ClientId, keypair: Keypair, sender: S) -> Self {
        ClientRole {
            sender,
            client_id,
            keypair,
            ephemeral: None,
            config: SessionConfig::default(),
            state: StateMachine::new("client", ClientState::Idle),
            trustee_pks: Vec::new(),
            relay_pk: None,
            slot: None,
            dcnet: None,
            outbound: VecDeque::new(),
            delivered: VecDeque::new(),
            last_downstream_hash: None,
            echo_request_pending: false,
            awaiting_echo_of: None,
            sent_history: BTreeMap::new(),
            pending_blame: None,
        }
    }

    // ------------------------------------------------------------------------
    // INSPECTION & HOST HOOKS
    // ------------------------------------------------------------------------

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state_name(&self) -> &'static str {
        self.state.state_name()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.is(ClientState::Shutdown)
    }

    /// The pseudonym slot, once the shuffle is verified.
    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    /// Queue bytes for anonymous upstream transmission.
    pub fn queue_upstream_data(&mut self, data: &[u8]) {
        self.outbound.extend(data);
    }

    pub fn has_queued_data(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drain the downstream payloads received so far.
    pub fn take_delivered(&mut self) -> Vec<Vec<u8>> {
        self.delivered.drain(..).collect()
    }

    // ------------------------------------------------------------------------
    // DISPATCH
    // ------------------------------------------------------------------------

    pub fn process(&mut self, msg: ProtocolMessage) -> Result<(), CoreError> {
        if self.state.is(ClientState::Shutdown) {
            return Ok(());
        }
        match msg {
            ProtocolMessage::Parameters(p) => self.on_parameters(p),
            ProtocolMessage::Shutdown => {
                info!(client = self.client_id, "client shutting down");
                self.state.transition(ClientState::Shutdown)?;
                Ok(())
            }
            ProtocolMessage::SchedulePublished {
                base,
                relay_key,
                eph_pks,
                sigs,
            } => self.on_schedule_published(base, relay_key, eph_pks, sigs),
            ProtocolMessage::DownstreamData(cell) | ProtocolMessage::DownstreamDataUdp(cell) => {
                self.on_downstream(cell)
            }
            ProtocolMessage::DisruptionReveal { round_id, bit_pos } => {
                warn!(
                    client = self.client_id,
                    round = round_id,
                    bit_pos,
                    "disruption reveal requested"
                );
                Ok(())
            }
            other => Err(CoreError::UnexpectedMessage {
                message: other.message_type(),
                state: self.state.state_name(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // SETUP
    // ------------------------------------------------------------------------

    fn on_parameters(&mut self, msg: ParametersMessage) -> Result<(), CoreError> {
        if !self.state.is(ClientState::Idle) && !msg.force_params {
            return Err(CoreError::UnexpectedMessage {
                message: "Parameters",
                state: self.state.state_name(),
            });
        }

        self.config = self.config.merged_with(&msg.params);
        self.client_id = msg
            .params
            .int_or(keys::NEXT_FREE_CLIENT_ID, i64::from(self.client_id))
            as ClientId;

        self.trustee_pks = msg
            .trustees_pks
            .iter()
            .map(point_from_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(pk) = &msg.relay_pk {
            self.relay_pk = Some(point_from_bytes(pk)?);
        }

        let ephemeral = Keypair::generate(&mut OsRng);
        info!(
            client = self.client_id,
            ephemeral = %ephemeral.fingerprint(),
            "registering keys"
        );
        let register = ProtocolMessage::ClientPublicKeys {
            client_id: self.client_id,
            pk: self.keypair.public_bytes(),
            eph_pk: ephemeral.public_bytes(),
        };
        self.ephemeral = Some(ephemeral);
        self.sender.send_to_relay(&register)?;
        self.state.transition(ClientState::EphKeysSent)?;
        Ok(())
    }

    fn on_schedule_published(
        &mut self,
        base: [u8; 32],
        relay_key: [u8; 32],
        eph_pks: Vec<[u8; 32]>,
        sigs: Vec<Vec<u8>>,
    ) -> Result<(), CoreError> {
        if !self.state.is(ClientState::EphKeysSent) {
            return Err(CoreError::UnexpectedMessage {
                message: "SchedulePublished",
                state: self.state.state_name(),
            });
        }

        if let Err(e) = verify_schedule(&base, &relay_key, &eph_pks, &sigs, &self.trustee_pks) {
            error!(client = self.client_id, error = %e, "schedule rejected");
            self.state.transition(ClientState::Shutdown)?;
            return Err(e.into());
        }

        let ephemeral = self.ephemeral.as_ref().expect("keys sent before schedule");
        let slot = match find_own_slot(&base, &eph_pks, ephemeral.secret())? {
            Some(slot) => slot,
            None => {
                error!(client = self.client_id, "own key missing from schedule");
                self.state.transition(ClientState::Shutdown)?;
                return Err(CoreError::SessionAborted(
                    "own ephemeral key missing from the shuffled schedule".into(),
                ));
            }
        };
        info!(client = self.client_id, slot, "slot assigned");
        self.slot = Some(slot);

        // Pairwise pad secrets with every trustee, trustee order.
        let secrets: Vec<SharedSecret> = self
            .trustee_pks
            .iter()
            .map(|pk| SharedSecret::for_pads(&self.keypair, pk))
            .collect();

        // Disruption MAC secret: only this slot's owner and the relay can
        // compute it, via the relay key carried through the shuffle.
        let mac_key = if self.config.disruption_protection {
            let shuffled_relay_key = point_from_bytes(&relay_key)?;
            Some(SharedSecret::for_disruption_mac(
                &(ephemeral.secret() * shuffled_relay_key),
            ))
        } else {
            None
        };

        self.dcnet = Some(DcNetEntity::new(
            self.client_id,
            DcNetRole::Client,
            self.config.payload_size,
            self.config.equivocation_protection,
            self.config.disruption_protection,
            secrets,
            mac_key,
        )?);
        self.state.transition(ClientState::ShuffleReceived)?;

        // Round 0 closes the setup: everyone contributes an empty cipher.
        let cipher = self
            .dcnet
            .as_mut()
            .expect("just built")
            .encode_for_round(0, false, None, false)?;
        self.sender.send_to_relay(&ProtocolMessage::UpstreamData {
            client_id: self.client_id,
            round_id: 0,
            data: cipher,
        })?;
        self.state.transition(ClientState::Communicating)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // STEADY STATE
    // ------------------------------------------------------------------------

    fn on_downstream(&mut self, cell: DownstreamCell) -> Result<(), CoreError> {
        if !self.state.is(ClientState::Communicating) {
            return Err(CoreError::UnexpectedMessage {
                message: "DownstreamData",
                state: self.state.state_name(),
            });
        }

        if cell.flag_resync {
            warn!(client = self.client_id, "resync requested, restarting");
            self.reset_session();
            return Ok(());
        }

        // History first: relay and clients must fold cells in identical
        // order for equivocation protection to line up.
        self.dcnet
            .as_mut()
            .expect("communicating implies entity")
            .update_history(&cell.data);

        if self.config.disruption_protection {
            self.verify_downstream_consistency(&cell);
        }
        self.last_downstream_hash = Some(sha256(&cell.data));

        if cell.data.iter().any(|&b| b != 0) {
            self.delivered.push_back(cell.data.clone());
        }

        if cell.flag_open_closed_request {
            self.send_open_closed_bitmap(cell.round_id)
        } else {
            self.send_upstream(&cell)
        }
    }

    /// Compare the relay's claimed hash of the previous downstream with
    /// what we actually received, and handle an awaited echo.
    fn verify_downstream_consistency(&mut self, cell: &DownstreamCell) {
        if let Some(expected) = self.last_downstream_hash {
            let claimed = cell.hash_of_previous_upstream;
            if claimed != [0u8; 32] && claimed != expected {
                warn!(
                    client = self.client_id,
                    round = cell.round_id,
                    "downstream hash mismatch, requesting echo"
                );
                self.echo_request_pending = true;
            }
        }

        if let Some(echo_round) = self.awaiting_echo_of {
            // The retransmission is the downstream cell right after the
            // requesting round; any other cell does not carry it.
            if cell.round_id == echo_round + 1 {
                self.awaiting_echo_of = None;
                if let Some(sent) = echo_round
                    .checked_sub(1)
                    .and_then(|r| self.sent_history.get(&r))
                {
                    if let Some(bit_pos) = first_differing_bit(sent, &cell.data) {
                        error!(
                            client = self.client_id,
                            round = echo_round - 1,
                            bit_pos,
                            "echo differs from sent payload, raising blame"
                        );
                        self.pending_blame = Some((echo_round - 1, bit_pos));
                    }
                }
            } else if cell.round_id > echo_round + 1 {
                warn!(
                    client = self.client_id,
                    echo_round, "echo retransmission never arrived, dropping marker"
                );
                self.awaiting_echo_of = None;
            }
        }
    }

    fn send_open_closed_bitmap(&mut self, round_id: RoundId) -> Result<(), CoreError> {
        let slot = self.slot.expect("communicating implies slot");
        let bitmap = owner_contribution(slot, self.config.n_clients, !self.outbound.is_empty())?;
        let cipher = self
            .dcnet
            .as_mut()
            .expect("communicating implies entity")
            .encode_for_round(round_id, false, Some(&bitmap), false)?;
        debug!(
            client = self.client_id,
            round = round_id,
            wants = !self.outbound.is_empty(),
            "sending open/closed bitmap"
        );
        self.sender
            .send_to_relay(&ProtocolMessage::OpenClosedData {
                client_id: self.client_id,
                round_id,
                data: cipher,
            })?;
        Ok(())
    }

    fn send_upstream(&mut self, cell: &DownstreamCell) -> Result<(), CoreError> {
        let slot = self.slot.expect("communicating implies slot");
        let is_owner = cell.ownership_id == Some(slot);
        let round_id = cell.round_id;

        let (payload, echo_last): (Option<Vec<u8>>, bool) = if !is_owner {
            (None, false)
        } else if let Some((blame_round, bit_pos)) = self.pending_blame.take() {
            let mut blame = Vec::with_capacity(13);
            blame.extend_from_slice(b"BLAME");
            blame.extend_from_slice(&blame_round.to_be_bytes());
            blame.extend_from_slice(&bit_pos.to_be_bytes());
            (Some(blame), true)
        } else {
            let capacity = self
                .dcnet
                .as_ref()
                .expect("communicating implies entity")
                .owner_payload_size();
            let take = self.outbound.len().min(capacity);
            let payload: Vec<u8> = self.outbound.drain(..take).collect();
            let echo = self.echo_request_pending;
            if payload.is_empty() && !echo {
                (None, false)
            } else {
                (Some(payload), echo)
            }
        };

        if echo_last {
            self.echo_request_pending = false;
            self.awaiting_echo_of = Some(round_id);
        }

        let dcnet = self.dcnet.as_mut().expect("communicating implies entity");
        let cipher = dcnet.encode_for_round(round_id, is_owner, payload.as_deref(), echo_last)?;

        if self.config.disruption_protection && is_owner {
            if let Some(data) = &payload {
                let mut record = data.clone();
                record.resize(dcnet.owner_payload_size(), 0);
                self.sent_history.insert(round_id, record);
                let horizon = round_id.saturating_sub(2 * self.config.n_clients as RoundId);
                self.sent_history.retain(|&r, _| r >= horizon);
            }
        }

        self.sender.send_to_relay(&ProtocolMessage::UpstreamData {
            client_id: self.client_id,
            round_id,
            data: cipher,
        })?;
        Ok(())
    }

    fn reset_session(&mut self) {
        self.ephemeral = None;
        self.slot = None;
        self.dcnet = None;
        self.outbound.clear();
        self.last_downstream_hash = None;
        self.echo_request_pending = false;
        self.awaiting_echo_of = None;
        self.sent_history.clear();
        self.pending_blame = None;
        // Restart from IDLE; the relay re-sends parameters on resync.
        let _ = self.state.transition(ClientState::Idle);
    }
}

/// First bit where two buffers differ, over their common length.
fn first_differing_bit(a: &[u8], b: &[u8]) -> Option<u32> {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return Some(i as u32 * 8 + diff.trailing_zeros());
        }
    }
    None
}
