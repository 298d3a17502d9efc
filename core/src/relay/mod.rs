//! Relay role — drives the whole session
//!
//! Setup: collect trustee keys, collect client keys, chain the shuffle
//! through every trustee, collect transcript signatures, publish the
//! pseudonym schedule. Steady state: keep up to `window_size` rounds in
//! flight, XOR-decode each completed round, hand the plaintext down, and
//! watch liveness. All of it runs on one inbound queue; handlers never
//! block.

pub mod rounds;
pub mod stats;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use curve25519_dalek::ristretto::RistrettoPoint;
use tracing::{debug, error, info, warn};

use crate::config::{keys, SessionConfig};
use crate::crypto::{point_from_bytes, sha256, Keypair, SharedSecret};
use crate::dcnet::{split_disruption_content, DcNetEntity, DcNetRole};
use crate::message::{DownstreamCell, ParametersMessage, ProtocolMessage};
use crate::scheduler::slots::{bitmap_size, schedule_from_bitmap, SlotSchedule};
use crate::scheduler::RelayShuffleView;
use crate::statemachine::{RoleState, StateMachine};
use crate::transport::MessageSender;
use crate::{ClientId, CoreError, RoundId, SlotId, TrusteeId};

use rounds::{CipherAdded, RateSignal, RoundManager};
use stats::SessionStats;

// ============================================================================
// STATE MACHINE
// ============================================================================

/// The relay's session states, in setup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    CollectingTrusteesPks,
    CollectingClientPks,
    CollectingShuffles,
    CollectingShuffleSigs,
    Communicating,
    Shutdown,
}

impl RoleState for RelayState {
    fn name(&self) -> &'static str {
        match self {
            RelayState::Idle => "IDLE",
            RelayState::CollectingTrusteesPks => "COLLECTING_TRUSTEES_PKS",
            RelayState::CollectingClientPks => "COLLECTING_CLIENT_PKS",
            RelayState::CollectingShuffles => "COLLECTING_SHUFFLES",
            RelayState::CollectingShuffleSigs => "COLLECTING_SHUFFLE_SIGS",
            RelayState::Communicating => "COMMUNICATING",
            RelayState::Shutdown => "SHUTDOWN",
        }
    }

    fn can_transition(&self, to: &Self) -> bool {
        use RelayState::*;
        matches!(
            (self, to),
            (Idle, CollectingTrusteesPks)
                | (CollectingTrusteesPks, CollectingClientPks)
                | (CollectingClientPks, CollectingShuffles)
                | (CollectingShuffles, CollectingShuffleSigs)
                | (CollectingShuffleSigs, Communicating)
                | (_, Shutdown)
        )
    }
}

// ============================================================================
// SUPPORT TYPES
// ============================================================================

/// What the relay knows about one registered peer.
struct NodeRecord {
    connected: bool,
    pk: Option<RistrettoPoint>,
    eph_pk: Option<RistrettoPoint>,
}

impl NodeRecord {
    fn empty() -> Self {
        NodeRecord {
            connected: false,
            pk: None,
            eph_pk: None,
        }
    }
}

/// A downstream cell kept around for the UDP→TCP retransmit path.
struct SentCell {
    cell: DownstreamCell,
    retransmitted: bool,
}

// ============================================================================
// RELAY ROLE
// ============================================================================

pub struct RelayRole<S: MessageSender> {
    sender: S,
    keypair: Keypair,
    config: SessionConfig,
    state: StateMachine<RelayState>,

    clients: Vec<NodeRecord>,
    trustees: Vec<NodeRecord>,
    n_trustee_pks_collected: usize,
    n_client_pks_collected: usize,

    shuffle: Option<RelayShuffleView>,
    dcnet: Option<DcNetEntity>,
    rounds: RoundManager,

    schedule: SlotSchedule,
    oc_request_rounds: HashSet<RoundId>,
    round_owners: HashMap<RoundId, Option<SlotId>>,
    /// Per-slot MAC secrets: `relay_sk · shuffled_eph_pk[k]`, computable
    /// on the other side only by the slot owner.
    slot_mac_keys: Vec<SharedSecret>,

    non_acked_downstream: usize,
    hash_of_last_downstream: [u8; 32],
    last_plaintext_by_round: BTreeMap<RoundId, Vec<u8>>,
    echo_flags: BTreeMap<RoundId, bool>,

    priority_data: VecDeque<Vec<u8>>,
    data_for_clients: VecDeque<Vec<u8>>,
    decoded_output: VecDeque<Vec<u8>>,
    /// When false, decoded upstream is echoed back down to the clients;
    /// when true it is queued for the host (exit proxy) instead.
    data_output_enabled: bool,

    consecutive_failed_rounds: u32,
    sent_cells: HashMap<RoundId, SentCell>,
    requested_pause: Option<Duration>,
    stats: SessionStats,
}

impl<S: MessageSender> RelayRole<S> {
    pub fn new(keypair: Keypair, sender: S) -> Self {
        let config = SessionConfig::default();
        let rounds = RoundManager::new(
            config.n_clients,
            config.n_trustees,
            config.window_size,
            config.trustee_cache_low_bound,
            config.trustee_cache_high_bound,
        );
        RelayRole {
            sender,
            keypair,
            config,
            state: StateMachine::new("relay", RelayState::Idle),
            clients: Vec::new(),
            trustees: Vec::new(),
            n_trustee_pks_collected: 0,
            n_client_pks_collected: 0,
            shuffle: None,
            dcnet: None,
            rounds,
            schedule: SlotSchedule::from_open_slots(Vec::new()),
            oc_request_rounds: HashSet::new(),
            round_owners: HashMap::new(),
            slot_mac_keys: Vec::new(),
            non_acked_downstream: 0,
            hash_of_last_downstream: [0u8; 32],
            last_plaintext_by_round: BTreeMap::new(),
            echo_flags: BTreeMap::new(),
            priority_data: VecDeque::new(),
            data_for_clients: VecDeque::new(),
            decoded_output: VecDeque::new(),
            data_output_enabled: false,
            consecutive_failed_rounds: 0,
            sent_cells: HashMap::new(),
            requested_pause: None,
            stats: SessionStats::default(),
        }
    }

    // ------------------------------------------------------------------------
    // INSPECTION & HOST HOOKS
    // ------------------------------------------------------------------------

    pub fn state_name(&self) -> &'static str {
        self.state.state_name()
    }

    pub fn is_communicating(&self) -> bool {
        self.state.is(RelayState::Communicating)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.is(RelayState::Shutdown)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Queue exit-proxy traffic for the next downstream cells.
    pub fn queue_data_for_clients(&mut self, data: Vec<u8>) {
        self.data_for_clients.push_back(data);
    }

    /// Route decoded upstream to the host instead of echoing it down.
    pub fn set_data_output_enabled(&mut self, enabled: bool) {
        self.data_output_enabled = enabled;
    }

    /// Drain the decoded upstream cells held for the host.
    pub fn take_decoded_output(&mut self) -> Vec<Vec<u8>> {
        self.decoded_output.drain(..).collect()
    }

    /// A sleep the host loop should apply before pumping again (all-slots
    /// closed delay or the configured inter-round pause).
    pub fn take_requested_pause(&mut self) -> Option<Duration> {
        self.requested_pause.take()
    }

    // ------------------------------------------------------------------------
    // DISPATCH
    // ------------------------------------------------------------------------

    /// Handle one inbound message. Errors are typed; fatal ones have
    /// already moved the relay to SHUTDOWN by the time they propagate.
    pub fn process(&mut self, msg: ProtocolMessage) -> Result<(), CoreError> {
        if self.state.is(RelayState::Shutdown) {
            return Ok(());
        }
        match msg {
            ProtocolMessage::Parameters(p) => self.on_parameters(p),
            ProtocolMessage::Shutdown => self.on_shutdown(),
            ProtocolMessage::TrusteePublicKey { trustee_id, pk } => {
                self.on_trustee_pk(trustee_id, pk)
            }
            ProtocolMessage::ClientPublicKeys {
                client_id,
                pk,
                eph_pk,
            } => self.on_client_pks(client_id, pk, eph_pk),
            ProtocolMessage::ShuffleResult {
                trustee_id,
                new_base,
                new_relay_key,
                new_eph_pks,
                proof,
            } => self.on_shuffle_result(trustee_id, new_base, new_relay_key, new_eph_pks, proof),
            ProtocolMessage::TranscriptSignature { trustee_id, sig } => {
                self.on_transcript_signature(trustee_id, sig)
            }
            ProtocolMessage::UpstreamData {
                client_id,
                round_id,
                data,
            } => self.on_client_cipher(client_id, round_id, data),
            ProtocolMessage::OpenClosedData {
                client_id,
                round_id,
                data,
            } => self.on_client_cipher(client_id, round_id, data),
            ProtocolMessage::TrusteeCipher {
                trustee_id,
                round_id,
                data,
            } => self.on_trustee_cipher(trustee_id, round_id, data),
            other => Err(CoreError::UnexpectedMessage {
                message: other.message_type(),
                state: self.state.state_name(),
            }),
        }
    }

    /// Drive the T1 (UDP retransmit) and T2 (liveness) timers. The host
    /// loop calls this periodically; tests call it directly.
    pub fn check_timeouts(&mut self) -> Result<(), CoreError> {
        if !self.state.is(RelayState::Communicating) {
            return Ok(());
        }
        let Some(round) = self.rounds.current_round() else {
            return Ok(());
        };
        let Some(age) = self.rounds.time_spent_in_round(round) else {
            return Ok(());
        };

        let t2 = Duration::from_millis(self.config.round_timeout_ms);
        let t1 = t2 / 2;

        if self.config.use_udp && age > t1 {
            let cell = match self.sent_cells.get_mut(&round) {
                Some(sent) if !sent.retransmitted => {
                    sent.retransmitted = true;
                    Some(sent.cell.clone())
                }
                _ => None,
            };
            if let Some(cell) = cell {
                info!(round, "T1 expired, retransmitting downstream over unicast");
                let msg = ProtocolMessage::DownstreamData(cell);
                for id in 0..self.config.n_clients as ClientId {
                    if self.clients[id as usize].connected {
                        let _ = self.sender.send_to_client(id, &msg);
                    }
                }
            }
        }

        if age > t2 {
            self.on_round_timeout(round)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // SETUP HANDLERS
    // ------------------------------------------------------------------------

    fn on_parameters(&mut self, msg: ParametersMessage) -> Result<(), CoreError> {
        if !self.state.is(RelayState::Idle) && !msg.force_params {
            return Err(CoreError::UnexpectedMessage {
                message: "Parameters",
                state: self.state.state_name(),
            });
        }

        let mut config = self.config.merged_with(&msg.params);
        if config.payload_size == 0 {
            return self.abort_session("PayloadSize cannot be 0");
        }
        if config.use_open_closed_slots && config.payload_size < bitmap_size(config.n_clients) {
            return self.abort_session("PayloadSize cannot hold the open/closed bitmap");
        }
        if (config.equivocation_protection || config.disruption_protection)
            && config.window_size > 1
        {
            // Equivocation: the history hash folds every downstream cell
            // in order; more than one round in flight desynchronizes it
            // between the relay and the clients. Disruption: the echo
            // retransmission must be the downstream cell right after the
            // requesting round, which pipelined rounds already in flight
            // would displace.
            warn!(
                window = config.window_size,
                "equivocation/disruption protection forces a window of 1"
            );
            config.window_size = 1;
        }

        self.config = config;
        self.clients = (0..self.config.n_clients).map(|_| NodeRecord::empty()).collect();
        self.trustees = (0..self.config.n_trustees).map(|_| NodeRecord::empty()).collect();
        self.n_trustee_pks_collected = 0;
        self.n_client_pks_collected = 0;
        self.rounds = RoundManager::new(
            self.config.n_clients,
            self.config.n_trustees,
            self.config.window_size,
            self.config.trustee_cache_low_bound,
            self.config.trustee_cache_high_bound,
        );
        self.schedule = SlotSchedule::from_open_slots(Vec::new());
        self.non_acked_downstream = 0;

        let start_now = msg.params.bool_or(keys::START_NOW, false);
        info!(
            n_clients = self.config.n_clients,
            n_trustees = self.config.n_trustees,
            payload_size = self.config.payload_size,
            start_now,
            "relay initialized by parameters"
        );

        if start_now {
            self.state.transition(RelayState::CollectingTrusteesPks)?;
            for j in 0..self.config.n_trustees {
                let mut params = self.config.to_params();
                params.add_bool(keys::START_NOW, true);
                params.add_int(keys::NEXT_FREE_TRUSTEE_ID, j as i64);
                let to_send = ProtocolMessage::Parameters(ParametersMessage {
                    params,
                    force_params: true,
                    trustees_pks: Vec::new(),
                    relay_pk: Some(self.keypair.public_bytes()),
                });
                self.send_to_trustee_logged(j as TrusteeId, &to_send);
            }
        }
        Ok(())
    }

    fn on_trustee_pk(&mut self, trustee_id: TrusteeId, pk: [u8; 32]) -> Result<(), CoreError> {
        if !self.state.is(RelayState::CollectingTrusteesPks) {
            return Err(CoreError::UnexpectedMessage {
                message: "TrusteePublicKey",
                state: self.state.state_name(),
            });
        }
        let record = self
            .trustees
            .get_mut(trustee_id as usize)
            .ok_or(CoreError::UnknownPeer(trustee_id))?;

        let point = match point_from_bytes(&pk) {
            Ok(p) => p,
            Err(e) => {
                self.abort_session("malformed trustee public key")?;
                return Err(e.into());
            }
        };
        if record.pk.is_none() {
            record.pk = Some(point);
            record.connected = true;
            self.n_trustee_pks_collected += 1;
        }
        info!(
            trustee = trustee_id,
            collected = self.n_trustee_pks_collected,
            total = self.config.n_trustees,
            "trustee public key received"
        );

        if self.n_trustee_pks_collected == self.config.n_trustees {
            let trustees_pks: Vec<[u8; 32]> = self
                .trustees
                .iter()
                .map(|t| crate::crypto::point_to_bytes(&t.pk.expect("counted complete")))
                .collect();
            for i in 0..self.config.n_clients {
                let mut params = self.config.to_params();
                params.add_bool(keys::START_NOW, true);
                params.add_int(keys::NEXT_FREE_CLIENT_ID, i as i64);
                let to_send = ProtocolMessage::Parameters(ParametersMessage {
                    params,
                    force_params: true,
                    trustees_pks: trustees_pks.clone(),
                    relay_pk: Some(self.keypair.public_bytes()),
                });
                self.send_to_client_logged(i as ClientId, &to_send);
            }
            self.state.transition(RelayState::CollectingClientPks)?;
        }
        Ok(())
    }

    fn on_client_pks(
        &mut self,
        client_id: ClientId,
        pk: [u8; 32],
        eph_pk: [u8; 32],
    ) -> Result<(), CoreError> {
        if !self.state.is(RelayState::CollectingClientPks) {
            return Err(CoreError::UnexpectedMessage {
                message: "ClientPublicKeys",
                state: self.state.state_name(),
            });
        }
        let record = self
            .clients
            .get_mut(client_id as usize)
            .ok_or(CoreError::UnknownPeer(client_id))?;

        let (pk_point, eph_point) = match (point_from_bytes(&pk), point_from_bytes(&eph_pk)) {
            (Ok(p), Ok(e)) => (p, e),
            _ => {
                self.abort_session("malformed client public key")?;
                return Err(crate::crypto::CryptoError::InvalidPoint.into());
            }
        };
        if record.pk.is_none() {
            record.pk = Some(pk_point);
            record.eph_pk = Some(eph_point);
            record.connected = true;
            self.n_client_pks_collected += 1;
        }
        info!(
            client = client_id,
            collected = self.n_client_pks_collected,
            total = self.config.n_clients,
            "client public keys received"
        );

        if self.n_client_pks_collected == self.config.n_clients {
            let eph_pks = self
                .clients
                .iter()
                .map(|c| c.eph_pk.expect("counted complete"))
                .collect();
            self.shuffle = Some(RelayShuffleView::new(
                self.config.n_trustees,
                self.keypair.public(),
                eph_pks,
            ));
            self.send_next_shuffle_request()?;
            self.state.transition(RelayState::CollectingShuffles)?;
        }
        Ok(())
    }

    fn send_next_shuffle_request(&mut self) -> Result<(), CoreError> {
        let shuffle = self.shuffle.as_ref().expect("shuffle view exists");
        let trustee = shuffle.next_trustee()?;
        let (base, relay_key, eph_pks) = shuffle.current_parts();
        let client_pks: Vec<[u8; 32]> = self
            .clients
            .iter()
            .map(|c| crate::crypto::point_to_bytes(&c.pk.expect("setup complete")))
            .collect();
        debug!(trustee, "sending shuffle request");
        self.send_to_trustee_logged(
            trustee,
            &ProtocolMessage::ShuffleRequest {
                client_pks,
                eph_pks,
                base,
                relay_key,
            },
        );
        Ok(())
    }

    fn on_shuffle_result(
        &mut self,
        trustee_id: TrusteeId,
        new_base: [u8; 32],
        new_relay_key: [u8; 32],
        new_eph_pks: Vec<[u8; 32]>,
        proof: crate::crypto::shuffle::ShuffleProof,
    ) -> Result<(), CoreError> {
        if !self.state.is(RelayState::CollectingShuffles) {
            return Err(CoreError::UnexpectedMessage {
                message: "ShuffleResult",
                state: self.state.state_name(),
            });
        }

        let shuffle = self.shuffle.as_mut().expect("shuffle view exists");
        let done = match shuffle.receive_step(&new_base, &new_relay_key, &new_eph_pks, proof) {
            Ok(done) => done,
            Err(e) => {
                error!(trustee = trustee_id, error = %e, "shuffle step rejected");
                self.abort_session("shuffle verification failed")?;
                return Err(e.into());
            }
        };

        if !done {
            self.send_next_shuffle_request()?;
            return Ok(());
        }

        // Chain complete: release the transcript for trustee verification.
        let transcript = {
            let shuffle = self.shuffle.as_ref().expect("shuffle view exists");
            shuffle.transcript()?
        };
        for j in 0..self.config.n_trustees {
            self.send_to_trustee_logged(
                j as TrusteeId,
                &ProtocolMessage::ShuffleTranscript(transcript.clone()),
            );
        }

        // The relay's DC-net entity and the per-slot MAC secrets are fixed
        // from the final shuffle state.
        let mac_keys: Vec<SharedSecret> = {
            let final_state = self
                .shuffle
                .as_ref()
                .expect("shuffle view exists")
                .final_state()?;
            final_state
                .keys
                .iter()
                .map(|key| SharedSecret::for_disruption_mac(&self.keypair.diffie_hellman(key)))
                .collect()
        };
        self.slot_mac_keys = mac_keys;
        let entity = DcNetEntity::new(
            0,
            DcNetRole::Relay,
            self.config.payload_size,
            self.config.equivocation_protection,
            self.config.disruption_protection,
            Vec::new(),
            None,
        )?;
        self.dcnet = Some(entity);
        self.state.transition(RelayState::CollectingShuffleSigs)?;
        Ok(())
    }

    fn on_transcript_signature(
        &mut self,
        trustee_id: TrusteeId,
        sig: Vec<u8>,
    ) -> Result<(), CoreError> {
        if !self.state.is(RelayState::CollectingShuffleSigs) {
            return Err(CoreError::UnexpectedMessage {
                message: "TranscriptSignature",
                state: self.state.state_name(),
            });
        }
        let trustee_pk = self
            .trustees
            .get(trustee_id as usize)
            .and_then(|t| t.pk)
            .ok_or(CoreError::UnknownPeer(trustee_id))?;

        let shuffle = self.shuffle.as_mut().expect("shuffle view exists");
        let all = match shuffle.receive_signature(trustee_id, sig, &trustee_pk) {
            Ok(all) => all,
            Err(e) => {
                error!(trustee = trustee_id, error = %e, "transcript signature rejected");
                self.abort_session("invalid shuffle signature")?;
                return Err(e.into());
            }
        };
        if !all {
            return Ok(());
        }

        let shuffle = self.shuffle.as_ref().expect("shuffle view exists");
        let final_state = shuffle.final_state()?;
        let msg = ProtocolMessage::SchedulePublished {
            base: crate::crypto::point_to_bytes(&final_state.base),
            relay_key: crate::crypto::point_to_bytes(&final_state.relay_key),
            eph_pks: final_state
                .keys
                .iter()
                .map(crate::crypto::point_to_bytes)
                .collect(),
            sigs: shuffle.signatures()?,
        };
        for i in 0..self.config.n_clients {
            self.send_to_client_logged(i as ClientId, &msg);
        }

        // Round 0 is the setup boundary: no downstream cell, every peer
        // answers with an empty cipher.
        self.dcnet.as_mut().expect("entity built").decode_start(0);
        let round0 = self.rounds.open_next_round();
        debug_assert_eq!(round0, 0);
        self.round_owners.insert(round0, None);
        self.non_acked_downstream = 1;
        self.state.transition(RelayState::Communicating)?;
        info!("setup complete, relay ready to communicate");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // STEADY-STATE HANDLERS
    // ------------------------------------------------------------------------

    fn on_client_cipher(
        &mut self,
        client_id: ClientId,
        round_id: RoundId,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        if !self.state.is(RelayState::Communicating) {
            return Err(CoreError::UnexpectedMessage {
                message: "UpstreamData",
                state: self.state.state_name(),
            });
        }
        let record = self
            .clients
            .get(client_id as usize)
            .ok_or(CoreError::UnknownPeer(client_id))?;
        if !record.connected {
            debug!(client = client_id, "cipher from disconnected client dropped");
            return Ok(());
        }

        match self.rounds.add_client_cipher(round_id, client_id, data) {
            Ok(CipherAdded::Buffered) => {}
            Ok(CipherAdded::IgnoredLate) => return Ok(()),
            Err(e) => {
                // Protocol violation: exclude the peer, keep the session.
                warn!(client = client_id, error = %e, "excluding client");
                self.clients[client_id as usize].connected = false;
                self.rounds.mark_client_disconnected(client_id);
                return Err(e.into());
            }
        }

        if self.rounds.has_all_ciphers_for_current_round() {
            self.upstream_phase()?;
        }
        Ok(())
    }

    fn on_trustee_cipher(
        &mut self,
        trustee_id: TrusteeId,
        round_id: RoundId,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        // Trustees start streaming as soon as they have signed, which can
        // be before the last signature reaches us.
        if !self.state.is(RelayState::Communicating)
            && !self.state.is(RelayState::CollectingShuffleSigs)
        {
            return Err(CoreError::UnexpectedMessage {
                message: "TrusteeCipher",
                state: self.state.state_name(),
            });
        }
        if self.trustees.get(trustee_id as usize).is_none() {
            return Err(CoreError::UnknownPeer(trustee_id));
        }

        match self.rounds.add_trustee_cipher(round_id, trustee_id, data) {
            Ok((CipherAdded::IgnoredLate, _)) => return Ok(()),
            Ok((CipherAdded::Buffered, signal)) => {
                if let Some(RateSignal::Stop(t)) = signal {
                    debug!(trustee = t, "cache above high bound, throttling");
                    self.send_to_trustee_logged(
                        t,
                        &ProtocolMessage::RateChange { window_capacity: 0 },
                    );
                    self.stats.rate_changes_sent += 1;
                }
            }
            Err(e) => {
                warn!(trustee = trustee_id, error = %e, "excluding trustee");
                self.trustees[trustee_id as usize].connected = false;
                self.rounds.mark_trustee_disconnected(trustee_id);
                return Err(e.into());
            }
        }

        if self.state.is(RelayState::Communicating)
            && self.rounds.has_all_ciphers_for_current_round()
        {
            self.upstream_phase()?;
        }
        Ok(())
    }

    /// All ciphers for the current round are in: decode, interpret, close
    /// the round, and refill the downstream window.
    fn upstream_phase(&mut self) -> Result<(), CoreError> {
        let round = self.rounds.current_round().ok_or(rounds::RoundError::NoOpenRound)?;
        let is_oc_round = self.oc_request_rounds.remove(&round);
        let (client_slices, trustee_slices) = self.rounds.collect_round_data()?;

        let dcnet = self.dcnet.as_mut().expect("communicating implies entity");
        for (_, slice) in &client_slices {
            dcnet.decode_client(round, slice)?;
        }
        for (_, slice) in &trustee_slices {
            dcnet.decode_trustee(round, slice)?;
        }
        let decoded = dcnet.decode_cell(is_oc_round)?;

        debug!(round, is_oc_round, "round decoded");

        if is_oc_round {
            let open = schedule_from_bitmap(&decoded.plaintext, self.config.n_clients)?;
            debug!(?open, "new open/closed schedule");
            self.schedule = SlotSchedule::from_open_slots(open);
            if self.schedule.is_empty() {
                self.requested_pause = Some(Duration::from_millis(
                    self.config.open_closed_min_delay_ms,
                ));
            }
        } else if round > 0 {
            self.extract_payload(round, decoded.plaintext)?;
        }

        self.finalize_round(round)?;

        if self.config.processing_loop_sleep_ms > 0 {
            self.requested_pause = Some(Duration::from_millis(
                self.config.processing_loop_sleep_ms,
            ));
        }

        if self.state.is(RelayState::Communicating) {
            self.downstream_phase_send_many()?;
        }
        Ok(())
    }

    fn extract_payload(&mut self, round: RoundId, mut plaintext: Vec<u8>) -> Result<(), CoreError> {
        if self.config.disruption_protection {
            let all_zero = plaintext.iter().all(|&b| b == 0);
            if all_zero {
                self.echo_flags.insert(round, false);
                self.last_plaintext_by_round.insert(round, Vec::new());
                return Ok(());
            }

            let parts = split_disruption_content(&plaintext)?;
            let owner = self.round_owners.get(&round).copied().flatten();
            if let Some(slot) = owner {
                let covered = &plaintext[crate::dcnet::DISRUPTION_MAC_LENGTH..];
                let mac_ok = crate::crypto::verify_mac(
                    &self.slot_mac_keys[slot as usize],
                    covered,
                    parts.mac,
                )
                .is_ok();
                if !mac_ok {
                    self.stats.disrupted_cells += 1;
                    error!(round, slot, "owner cell failed disruption MAC, blame phase");
                }
            }

            self.echo_flags.insert(round, parts.echo_last);
            if parts.echo_last {
                info!(round, "client requested echo of previous upstream");
                if parts.data.len() >= 13 && &parts.data[..5] == b"BLAME" {
                    let blame_round =
                        u32::from_be_bytes(parts.data[5..9].try_into().expect("slice of 4"));
                    let bit_pos =
                        u32::from_be_bytes(parts.data[9..13].try_into().expect("slice of 4"));
                    error!(blame_round, bit_pos, "disruption blame requested, revealing");
                    let reveal = ProtocolMessage::DisruptionReveal {
                        round_id: blame_round,
                        bit_pos,
                    };
                    for i in 0..self.config.n_clients {
                        self.send_to_client_logged(i as ClientId, &reveal);
                    }
                    for j in 0..self.config.n_trustees {
                        self.send_to_trustee_logged(j as TrusteeId, &reveal);
                    }
                    // A blame cell is control traffic, not data to echo.
                    return Ok(());
                }
            }
            plaintext = parts.data.to_vec();
            self.last_plaintext_by_round.insert(round, plaintext.clone());
        }

        self.stats.add_upstream_cell(plaintext.len());

        if plaintext.len() >= 2 && plaintext[0] == 0xAA && plaintext[1] == 0xAA {
            // Latency-test cell: echo with priority.
            self.priority_data.push_back(plaintext);
            return Ok(());
        }

        if plaintext.iter().any(|&b| b != 0) {
            if !self.config.disruption_protection {
                self.last_plaintext_by_round.insert(round, plaintext.clone());
            }
            if self.data_output_enabled {
                self.decoded_output.push_back(plaintext);
            } else {
                self.data_for_clients.push_back(plaintext);
            }
        }
        Ok(())
    }

    fn finalize_round(&mut self, round: RoundId) -> Result<(), CoreError> {
        self.non_acked_downstream = self.non_acked_downstream.saturating_sub(1);
        self.consecutive_failed_rounds = 0;

        if let Some(spent) = self.rounds.time_spent_in_round(round) {
            self.stats.add_closed_round(spent.as_millis() as u64);
        }

        let (closed, signals) = self.rounds.close_round()?;
        for signal in signals {
            if let RateSignal::Resume(t) = signal {
                debug!(trustee = t, "cache below low bound, resuming");
                self.send_to_trustee_logged(
                    t,
                    &ProtocolMessage::RateChange { window_capacity: 1 },
                );
                self.stats.rate_changes_sent += 1;
            }
        }

        self.sent_cells.remove(&closed);
        self.round_owners.remove(&closed);
        let horizon = closed.saturating_sub(self.config.n_clients as RoundId);
        self.last_plaintext_by_round.retain(|&r, _| r >= horizon);
        self.echo_flags.retain(|&r, _| r >= horizon);

        if self.config.experiment_round_limit >= 0
            && i64::from(closed) + 1 >= self.config.experiment_round_limit
        {
            info!(round = closed, "experiment round limit reached");
            return self.abort_session("experiment round limit reached");
        }

        if let Some(next) = self.rounds.current_round() {
            self.dcnet.as_mut().expect("entity built").decode_start(next);
        }
        Ok(())
    }

    fn downstream_phase_send_many(&mut self) -> Result<(), CoreError> {
        while self.non_acked_downstream < self.config.window_size
            && self.state.is(RelayState::Communicating)
        {
            self.open_round_and_send_downstream()?;
        }
        Ok(())
    }

    fn open_round_and_send_downstream(&mut self) -> Result<(), CoreError> {
        let mut content = self
            .priority_data
            .pop_front()
            .or_else(|| self.data_for_clients.pop_front())
            .unwrap_or_else(|| vec![0u8; 1]);

        // A client that saw an inconsistent broadcast asked for the
        // previous upstream again: retransmit it to everyone.
        if self.config.disruption_protection {
            if let Some(last_closed) = self.rounds.last_round_closed() {
                if self.echo_flags.get(&last_closed) == Some(&true) {
                    if let Some(prev) = last_closed
                        .checked_sub(1)
                        .and_then(|r| self.last_plaintext_by_round.get(&r))
                    {
                        info!(
                            round = last_closed,
                            "echo requested, retransmitting previous upstream"
                        );
                        content = prev.clone();
                    }
                    self.echo_flags.insert(last_closed, false);
                }
            }
        }

        if self.config.use_dummy_data_down && content.len() < self.config.downstream_cell_size {
            content.resize(self.config.downstream_cell_size, 0);
        }

        let next_round = self.rounds.next_round_to_open();

        let (owner, flag_oc) = if self.config.use_open_closed_slots {
            if self.schedule.is_exhausted() {
                self.oc_request_rounds.insert(next_round);
                (None, true)
            } else {
                (self.schedule.next_owner(), false)
            }
        } else {
            if self.schedule.is_exhausted() {
                self.schedule = SlotSchedule::all_open(self.config.n_clients);
            }
            (self.schedule.next_owner(), false)
        };

        let cell = DownstreamCell {
            round_id: next_round,
            ownership_id: owner,
            hash_of_previous_upstream: self.hash_of_last_downstream,
            data: content.clone(),
            flag_resync: false,
            flag_open_closed_request: flag_oc,
        };

        if self.rounds.open_rounds_count() == 0 {
            self.dcnet
                .as_mut()
                .expect("entity built")
                .decode_start(next_round);
        }
        self.rounds.open_next_round();
        self.round_owners.insert(next_round, owner);

        self.dcnet.as_mut().expect("entity built").update_history(&content);
        self.hash_of_last_downstream = sha256(&content);

        debug!(
            round = next_round,
            ?owner,
            oc_request = flag_oc,
            len = content.len(),
            "sending downstream cell"
        );

        let force_corrupt = self.config.force_disruption_since_round_3
            && next_round >= 3
            && self.config.n_clients > 0;
        if force_corrupt {
            // Test hook: client 0 sees a tampered copy of the broadcast.
            let mut tampered = cell.clone();
            tampered.data[0] ^= 0x01;
            self.send_to_client_logged(0, &ProtocolMessage::DownstreamData(tampered));
            for i in 1..self.config.n_clients {
                self.send_to_client_logged(
                    i as ClientId,
                    &ProtocolMessage::DownstreamData(cell.clone()),
                );
            }
            self.stats.add_downstream_cell(content.len(), false);
        } else if self.config.use_udp {
            let msg = ProtocolMessage::DownstreamDataUdp(cell.clone());
            if let Err(e) = self.sender.broadcast_to_all_clients(&msg) {
                warn!(error = %e, "downstream broadcast failed");
            }
            self.stats.add_downstream_cell(content.len(), true);
        } else {
            let msg = ProtocolMessage::DownstreamData(cell.clone());
            for i in 0..self.config.n_clients {
                if self.clients[i].connected {
                    self.send_to_client_logged(i as ClientId, &msg);
                }
            }
            self.stats.add_downstream_cell(content.len(), false);
        }

        self.sent_cells.insert(
            next_round,
            SentCell {
                cell,
                retransmitted: false,
            },
        );
        self.non_acked_downstream += 1;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // LIVENESS & SHUTDOWN
    // ------------------------------------------------------------------------

    fn on_round_timeout(&mut self, round: RoundId) -> Result<(), CoreError> {
        let (missing_clients, missing_trustees) = self.rounds.missing_contributors();
        warn!(
            round,
            ?missing_clients,
            ?missing_trustees,
            "round timed out, excluding unresponsive peers"
        );
        for id in &missing_clients {
            self.clients[*id as usize].connected = false;
            self.rounds.mark_client_disconnected(*id);
        }
        for id in &missing_trustees {
            self.trustees[*id as usize].connected = false;
            self.rounds.mark_trustee_disconnected(*id);
        }

        self.consecutive_failed_rounds += 1;
        self.stats.rounds_skipped += 1;
        if self.consecutive_failed_rounds > self.config.max_consecutive_failed_rounds {
            return self.abort_session("too many consecutive failed rounds");
        }

        // With the stragglers excluded the round may already be complete.
        if self.rounds.has_all_ciphers_for_current_round() {
            return self.upstream_phase();
        }

        // Otherwise skip it: discard buffers and move on.
        self.non_acked_downstream = self.non_acked_downstream.saturating_sub(1);
        self.oc_request_rounds.remove(&round);
        let (closed, signals) = self.rounds.close_round()?;
        for signal in signals {
            if let RateSignal::Resume(t) = signal {
                self.send_to_trustee_logged(
                    t,
                    &ProtocolMessage::RateChange { window_capacity: 1 },
                );
                self.stats.rate_changes_sent += 1;
            }
        }
        self.sent_cells.remove(&closed);
        self.round_owners.remove(&closed);
        if let Some(next) = self.rounds.current_round() {
            self.dcnet.as_mut().expect("entity built").decode_start(next);
        }
        self.downstream_phase_send_many()
    }

    fn on_shutdown(&mut self) -> Result<(), CoreError> {
        info!("relay received shutdown");
        self.broadcast_shutdown();
        self.state.transition(RelayState::Shutdown)?;
        Ok(())
    }

    fn broadcast_shutdown(&mut self) {
        for j in 0..self.config.n_trustees {
            let _ = self
                .sender
                .send_to_trustee(j as TrusteeId, &ProtocolMessage::Shutdown);
        }
        for i in 0..self.config.n_clients {
            let _ = self
                .sender
                .send_to_client(i as ClientId, &ProtocolMessage::Shutdown);
        }
    }

    fn abort_session(&mut self, reason: &str) -> Result<(), CoreError> {
        error!(reason, "aborting session");
        self.broadcast_shutdown();
        self.state.transition(RelayState::Shutdown)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // SEND HELPERS
    // ------------------------------------------------------------------------

    fn send_to_client_logged(&mut self, id: ClientId, msg: &ProtocolMessage) {
        if let Err(e) = self.sender.send_to_client(id, msg) {
            warn!(client = id, error = %e, "send failed, marking disconnected");
            if let Some(record) = self.clients.get_mut(id as usize) {
                record.connected = false;
            }
            self.rounds.mark_client_disconnected(id);
        }
    }

    fn send_to_trustee_logged(&mut self, id: TrusteeId, msg: &ProtocolMessage) {
        if let Err(e) = self.sender.send_to_trustee(id, msg) {
            warn!(trustee = id, error = %e, "send failed, marking disconnected");
            if let Some(record) = self.trustees.get_mut(id as usize) {
                record.connected = false;
            }
            self.rounds.mark_trustee_disconnected(id);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterMap;
    use crate::transport::LocalNetwork;
    use rand::rngs::OsRng;

    fn start_params(n_clients: i64, n_trustees: i64) -> ProtocolMessage {
        let mut params = ParameterMap::new();
        params.add_int(keys::N_CLIENTS, n_clients);
        params.add_int(keys::N_TRUSTEES, n_trustees);
        params.add_int(keys::PAYLOAD_SIZE, 100);
        params.add_bool(keys::START_NOW, true);
        ProtocolMessage::Parameters(ParametersMessage {
            params,
            force_params: true,
            trustees_pks: Vec::new(),
            relay_pk: None,
        })
    }

    #[test]
    fn parameters_bootstrap_the_trustees() {
        let net = LocalNetwork::new(2, 2);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());

        relay.process(start_params(2, 2)).unwrap();
        assert_eq!(relay.state_name(), "COLLECTING_TRUSTEES_PKS");

        for j in 0..2u16 {
            match net.trustee_inbox(j).try_recv().unwrap() {
                ProtocolMessage::Parameters(p) => {
                    assert_eq!(p.params.int_or(keys::NEXT_FREE_TRUSTEE_ID, -1), j as i64);
                    assert!(p.relay_pk.is_some());
                }
                other => panic!("wrong message: {}", other.message_type()),
            }
        }
    }

    #[test]
    fn zero_payload_aborts() {
        let net = LocalNetwork::new(1, 1);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());

        let mut params = ParameterMap::new();
        params.add_int(keys::PAYLOAD_SIZE, 0);
        params.add_bool(keys::START_NOW, true);
        relay
            .process(ProtocolMessage::Parameters(ParametersMessage {
                params,
                force_params: true,
                trustees_pks: Vec::new(),
                relay_pk: None,
            }))
            .unwrap();
        assert!(relay.is_shutdown());
    }

    #[test]
    fn trustee_keys_trigger_client_bootstrap() {
        let net = LocalNetwork::new(1, 1);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());
        relay.process(start_params(1, 1)).unwrap();

        let trustee_kp = Keypair::generate(&mut OsRng);
        relay
            .process(ProtocolMessage::TrusteePublicKey {
                trustee_id: 0,
                pk: trustee_kp.public_bytes(),
            })
            .unwrap();
        assert_eq!(relay.state_name(), "COLLECTING_CLIENT_PKS");

        // The client's parameters carry the trustee keys and the relay key.
        let inbox = net.client_inbox(0);
        match inbox.try_recv().unwrap() {
            ProtocolMessage::Parameters(p) => {
                assert_eq!(p.trustees_pks.len(), 1);
                assert_eq!(p.trustees_pks[0], trustee_kp.public_bytes());
                assert!(p.relay_pk.is_some());
            }
            other => panic!("wrong message: {}", other.message_type()),
        }
    }

    #[test]
    fn unknown_peer_ids_are_rejected() {
        let net = LocalNetwork::new(1, 1);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());
        relay.process(start_params(1, 1)).unwrap();

        let result = relay.process(ProtocolMessage::TrusteePublicKey {
            trustee_id: 5,
            pk: Keypair::generate(&mut OsRng).public_bytes(),
        });
        assert!(matches!(result, Err(CoreError::UnknownPeer(5))));
    }

    #[test]
    fn shutdown_is_forwarded_to_everyone() {
        let net = LocalNetwork::new(2, 1);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());
        relay.process(start_params(2, 1)).unwrap();

        // Drain the bootstrap traffic first.
        while net.trustee_inbox(0).try_recv().is_ok() {}

        relay.process(ProtocolMessage::Shutdown).unwrap();
        assert!(relay.is_shutdown());

        assert!(matches!(
            net.trustee_inbox(0).try_recv().unwrap(),
            ProtocolMessage::Shutdown
        ));
        for i in 0..2u16 {
            assert!(matches!(
                net.client_inbox(i).try_recv().unwrap(),
                ProtocolMessage::Shutdown
            ));
        }

        // Nothing is processed after shutdown.
        relay.process(start_params(2, 1)).unwrap();
        assert!(relay.is_shutdown());
    }

    #[test]
    fn steady_state_messages_rejected_during_setup() {
        let net = LocalNetwork::new(1, 1);
        let mut relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());
        relay.process(start_params(1, 1)).unwrap();

        let result = relay.process(ProtocolMessage::UpstreamData {
            client_id: 0,
            round_id: 0,
            data: vec![],
        });
        assert!(matches!(result, Err(CoreError::UnexpectedMessage { .. })));
    }
}
