// Buffered round manager — cipher buffering, window tracking, trustee
// rate limiting
//
// The relay opens up to `window_size` rounds at a time. Ciphers may
// arrive out of order and ahead of the current round; they are buffered
// per round and peer, duplicates rejected, late arrivals for closed
// rounds dropped silently. Trustees stream ahead, so the manager watches
// each trustee's buffered-ahead count and emits stop/resume signals when
// it crosses the configured bounds.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{ClientId, RoundId, TrusteeId};

/// Round manager error types
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("duplicate cipher for round {round} from {peer}")]
    DuplicateCipher { round: RoundId, peer: String },
    #[error("no round is currently open")]
    NoOpenRound,
    #[error("round {0} has not collected all ciphers")]
    RoundIncomplete(RoundId),
}

/// Throttle instruction for one trustee, surfaced to the relay loop which
/// owns the message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSignal {
    /// Send `RateChange { window_capacity: 0 }`.
    Stop(TrusteeId),
    /// Send `RateChange { window_capacity: 1 }`.
    Resume(TrusteeId),
}

/// What happened to a submitted cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAdded {
    /// Buffered (or immediately usable for the current round).
    Buffered,
    /// The round is already closed; dropped silently per protocol.
    IgnoredLate,
}

pub struct RoundManager {
    n_clients: usize,
    n_trustees: usize,
    window_size: usize,

    next_round_to_open: RoundId,
    open_rounds: VecDeque<RoundId>,
    last_round_closed: Option<RoundId>,

    client_ciphers: BTreeMap<RoundId, HashMap<ClientId, Vec<u8>>>,
    trustee_ciphers: BTreeMap<RoundId, HashMap<TrusteeId, Vec<u8>>>,

    opened_at: HashMap<RoundId, Instant>,

    disconnected_clients: HashSet<ClientId>,
    disconnected_trustees: HashSet<TrusteeId>,

    cache_low_bound: usize,
    cache_high_bound: usize,
    trustee_stopped: Vec<bool>,
}

impl RoundManager {
    pub fn new(
        n_clients: usize,
        n_trustees: usize,
        window_size: usize,
        cache_low_bound: usize,
        cache_high_bound: usize,
    ) -> Self {
        RoundManager {
            n_clients,
            n_trustees,
            window_size,
            next_round_to_open: 0,
            open_rounds: VecDeque::new(),
            last_round_closed: None,
            client_ciphers: BTreeMap::new(),
            trustee_ciphers: BTreeMap::new(),
            opened_at: HashMap::new(),
            disconnected_clients: HashSet::new(),
            disconnected_trustees: HashSet::new(),
            cache_low_bound,
            cache_high_bound,
            trustee_stopped: vec![false; n_trustees],
        }
    }

    // ------------------------------------------------------------------------
    // ROUND LIFECYCLE
    // ------------------------------------------------------------------------

    /// Reserve the next round id and open it. Ids are strictly increasing
    /// and never reused.
    pub fn open_next_round(&mut self) -> RoundId {
        let round = self.next_round_to_open;
        self.next_round_to_open += 1;
        self.open_rounds.push_back(round);
        self.opened_at.insert(round, Instant::now());
        trace!(round, open = self.open_rounds.len(), "round opened");
        round
    }

    /// The round currently being decoded: the lowest open round.
    pub fn current_round(&self) -> Option<RoundId> {
        self.open_rounds.front().copied()
    }

    /// The id `open_next_round` will hand out next.
    pub fn next_round_to_open(&self) -> RoundId {
        self.next_round_to_open
    }

    pub fn open_rounds_count(&self) -> usize {
        self.open_rounds.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn last_round_closed(&self) -> Option<RoundId> {
        self.last_round_closed
    }

    /// Wall-clock time since the round was opened.
    pub fn time_spent_in_round(&self, round: RoundId) -> Option<Duration> {
        self.opened_at.get(&round).map(Instant::elapsed)
    }

    /// Close the current round, free its buffers and evaluate trustee
    /// resume signals. Any leftover ciphers for the round are discarded,
    /// which is also how a timed-out round is skipped.
    pub fn close_round(&mut self) -> Result<(RoundId, Vec<RateSignal>), RoundError> {
        let round = self.open_rounds.pop_front().ok_or(RoundError::NoOpenRound)?;
        self.client_ciphers.remove(&round);
        self.trustee_ciphers.remove(&round);
        self.opened_at.remove(&round);
        self.last_round_closed = Some(round);
        debug!(round, "round closed");

        let mut signals = Vec::new();
        for trustee in 0..self.n_trustees as TrusteeId {
            if self.trustee_stopped[trustee as usize]
                && self.buffered_ahead(trustee) <= self.cache_low_bound
            {
                self.trustee_stopped[trustee as usize] = false;
                signals.push(RateSignal::Resume(trustee));
            }
        }
        Ok((round, signals))
    }

    // ------------------------------------------------------------------------
    // CIPHER BUFFERING
    // ------------------------------------------------------------------------

    fn is_closed(&self, round: RoundId) -> bool {
        round < self.next_round_to_open && !self.open_rounds.contains(&round)
    }

    /// Buffer a client cipher. Late ciphers for closed rounds are dropped
    /// silently; a duplicate for the same (round, client) is an error.
    pub fn add_client_cipher(
        &mut self,
        round: RoundId,
        client: ClientId,
        data: Vec<u8>,
    ) -> Result<CipherAdded, RoundError> {
        if self.is_closed(round) {
            trace!(round, client, "late client cipher dropped");
            return Ok(CipherAdded::IgnoredLate);
        }
        let slot = self.client_ciphers.entry(round).or_default();
        if slot.contains_key(&client) {
            return Err(RoundError::DuplicateCipher {
                round,
                peer: format!("client {client}"),
            });
        }
        slot.insert(client, data);
        Ok(CipherAdded::Buffered)
    }

    /// Buffer a trustee cipher and evaluate the stop bound.
    pub fn add_trustee_cipher(
        &mut self,
        round: RoundId,
        trustee: TrusteeId,
        data: Vec<u8>,
    ) -> Result<(CipherAdded, Option<RateSignal>), RoundError> {
        if self.is_closed(round) {
            trace!(round, trustee, "late trustee cipher dropped");
            return Ok((CipherAdded::IgnoredLate, None));
        }
        let slot = self.trustee_ciphers.entry(round).or_default();
        if slot.contains_key(&trustee) {
            return Err(RoundError::DuplicateCipher {
                round,
                peer: format!("trustee {trustee}"),
            });
        }
        slot.insert(trustee, data);

        let signal = if !self.trustee_stopped[trustee as usize]
            && self.buffered_ahead(trustee) >= self.cache_high_bound
        {
            self.trustee_stopped[trustee as usize] = true;
            Some(RateSignal::Stop(trustee))
        } else {
            None
        };
        Ok((CipherAdded::Buffered, signal))
    }

    /// Buffered ciphers from one trustee for rounds not yet collected.
    pub fn buffered_ahead(&self, trustee: TrusteeId) -> usize {
        self.trustee_ciphers
            .values()
            .filter(|by_peer| by_peer.contains_key(&trustee))
            .count()
    }

    // ------------------------------------------------------------------------
    // COMPLETION
    // ------------------------------------------------------------------------

    fn expected_clients(&self) -> usize {
        self.n_clients - self.disconnected_clients.len()
    }

    fn expected_trustees(&self) -> usize {
        self.n_trustees - self.disconnected_trustees.len()
    }

    /// Whether every connected client and trustee has contributed to the
    /// current round.
    pub fn has_all_ciphers_for_current_round(&self) -> bool {
        let Some(round) = self.current_round() else {
            return false;
        };
        let clients = self
            .client_ciphers
            .get(&round)
            .map_or(0, |by_peer| by_peer.len());
        let trustees = self
            .trustee_ciphers
            .get(&round)
            .map_or(0, |by_peer| by_peer.len());
        clients >= self.expected_clients() && trustees >= self.expected_trustees()
    }

    /// Peers the current round is still waiting on.
    pub fn missing_contributors(&self) -> (Vec<ClientId>, Vec<TrusteeId>) {
        let Some(round) = self.current_round() else {
            return (Vec::new(), Vec::new());
        };
        let empty_c = HashMap::new();
        let empty_t = HashMap::new();
        let clients = self.client_ciphers.get(&round).unwrap_or(&empty_c);
        let trustees = self.trustee_ciphers.get(&round).unwrap_or(&empty_t);

        let missing_clients = (0..self.n_clients as ClientId)
            .filter(|id| !self.disconnected_clients.contains(id) && !clients.contains_key(id))
            .collect();
        let missing_trustees = (0..self.n_trustees as TrusteeId)
            .filter(|id| !self.disconnected_trustees.contains(id) && !trustees.contains_key(id))
            .collect();
        (missing_clients, missing_trustees)
    }

    /// Pull the current round's ciphers out of the buffers for decoding.
    pub fn collect_round_data(
        &mut self,
    ) -> Result<(Vec<(ClientId, Vec<u8>)>, Vec<(TrusteeId, Vec<u8>)>), RoundError> {
        let round = self.current_round().ok_or(RoundError::NoOpenRound)?;
        if !self.has_all_ciphers_for_current_round() {
            return Err(RoundError::RoundIncomplete(round));
        }

        let mut clients: Vec<(ClientId, Vec<u8>)> = self
            .client_ciphers
            .remove(&round)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut trustees: Vec<(TrusteeId, Vec<u8>)> = self
            .trustee_ciphers
            .remove(&round)
            .unwrap_or_default()
            .into_iter()
            .collect();
        clients.sort_by_key(|(id, _)| *id);
        trustees.sort_by_key(|(id, _)| *id);
        Ok((clients, trustees))
    }

    // ------------------------------------------------------------------------
    // MEMBERSHIP
    // ------------------------------------------------------------------------

    /// Stop waiting for a client; the session proceeds without it.
    pub fn mark_client_disconnected(&mut self, client: ClientId) {
        self.disconnected_clients.insert(client);
    }

    pub fn mark_trustee_disconnected(&mut self, trustee: TrusteeId) {
        self.disconnected_trustees.insert(trustee);
    }
}

// ============================================================================
// TESTS
// ============================================================================
