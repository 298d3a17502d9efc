//! End-to-end sessions over the in-memory star network.
//!
//! Each test builds a relay, N clients and M trustees wired through a
//! `LocalNetwork`, then pumps the queues deterministically: no threads,
//! no sleeps, every message processed in arrival order.

use rand::rngs::OsRng;

use starcloak_core::config::{keys, ParameterMap};
use starcloak_core::crypto::Keypair;
use starcloak_core::message::{ParametersMessage, ProtocolMessage};
use starcloak_core::transport::LocalNetwork;
use starcloak_core::{ClientId, ClientRole, RelayRole, SlotId, TrusteeRole};

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    net: LocalNetwork,
    relay: RelayRole<LocalNetwork>,
    clients: Vec<ClientRole<LocalNetwork>>,
    trustees: Vec<TrusteeRole<LocalNetwork>>,
    /// Clients whose inbox is never drained (simulated crash).
    dead_clients: Vec<ClientId>,
    /// Every message kind each destination received, in order.
    log: Vec<(String, &'static str)>,
}

impl Harness {
    fn new(n_clients: usize, n_trustees: usize) -> Self {
        let net = LocalNetwork::new(n_clients, n_trustees);
        let relay = RelayRole::new(Keypair::generate(&mut OsRng), net.clone());
        let clients = (0..n_clients)
            .map(|i| ClientRole::new(i as ClientId, Keypair::generate(&mut OsRng), net.clone()))
            .collect();
        let trustees = (0..n_trustees)
            .map(|j| TrusteeRole::new(j as u16, Keypair::generate(&mut OsRng), net.clone()))
            .collect();
        Harness {
            net,
            relay,
            clients,
            trustees,
            dead_clients: Vec::new(),
            log: Vec::new(),
        }
    }

    fn base_params(&self, payload_size: i64) -> ParameterMap {
        let mut params = ParameterMap::new();
        params.add_int(keys::N_CLIENTS, self.clients.len() as i64);
        params.add_int(keys::N_TRUSTEES, self.trustees.len() as i64);
        params.add_int(keys::PAYLOAD_SIZE, payload_size);
        params.add_bool(keys::START_NOW, true);
        params
    }

    fn start(&mut self, params: ParameterMap) {
        self.relay
            .process(ProtocolMessage::Parameters(ParametersMessage {
                params,
                force_params: true,
                trustees_pks: Vec::new(),
                relay_pk: None,
            }))
            .unwrap();
    }

    /// Drain every inbox once. Returns whether anything was processed.
    fn pump_once(&mut self) -> bool {
        let mut progressed = false;

        while let Ok(msg) = self.net.relay_inbox().try_recv() {
            self.log.push(("relay".into(), msg.message_type()));
            self.relay.process(msg).unwrap();
            progressed = true;
        }
        for j in 0..self.trustees.len() {
            while let Ok(msg) = self.net.trustee_inbox(j as u16).try_recv() {
                self.log.push((format!("trustee {j}"), msg.message_type()));
                self.trustees[j].process(msg).unwrap();
                progressed = true;
            }
        }
        for i in 0..self.clients.len() {
            if self.dead_clients.contains(&(i as ClientId)) {
                continue;
            }
            while let Ok(msg) = self.net.client_inbox(i as ClientId).try_recv() {
                self.log.push((format!("client {i}"), msg.message_type()));
                self.clients[i].process(msg).unwrap();
                progressed = true;
            }
        }
        progressed
    }

    /// Pump queues and keep the trustee streams fed until `done` returns
    /// true. Panics if the session makes no progress toward it.
    fn run_until(&mut self, max_iters: usize, mut done: impl FnMut(&Harness) -> bool) {
        for _ in 0..max_iters {
            if done(self) {
                return;
            }
            self.pump_once();
            for trustee in &mut self.trustees {
                if trustee.is_streaming() {
                    trustee.stream_ciphers(1).unwrap();
                }
            }
            self.pump_once();
        }
        panic!(
            "condition not reached after {max_iters} iterations (relay state {})",
            self.relay.state_name()
        );
    }

    fn run_setup(&mut self) {
        self.run_until(50, |h| {
            h.relay.is_communicating() && h.clients.iter().all(|c| c.slot().is_some())
        });
    }

    /// The client currently holding `slot`.
    fn client_with_slot(&self, slot: SlotId) -> usize {
        self.clients
            .iter()
            .position(|c| c.slot() == Some(slot))
            .expect("every slot has an owner")
    }
}

// ============================================================================
// SETUP & STEADY STATE
// ============================================================================

#[test]
fn setup_assigns_every_client_a_distinct_slot() {
    let mut h = Harness::new(3, 2);
    let params = h.base_params(100);
    h.start(params);
    h.run_setup();

    let mut taken = vec![false; 3];
    for client in &h.clients {
        let slot = client.slot().expect("slot assigned") as usize;
        assert!(!taken[slot], "slot {slot} assigned twice");
        taken[slot] = true;
    }
    for trustee in &h.trustees {
        assert!(trustee.is_streaming());
    }
}

#[test]
fn owner_payload_round_trips_to_every_client() {
    // One owner encodes real data; everyone else contributes noise that
    // must cancel. The decoded plaintext comes back down to all clients.
    let mut h = Harness::new(3, 2);
    let params = h.base_params(100);
    h.start(params);
    h.run_setup();

    let sender_idx = h.client_with_slot(0);
    let mut payload = b"HELLO".to_vec();
    payload.resize(100, 0);
    h.clients[sender_idx].queue_upstream_data(&payload);

    // Run enough rounds for the owner's slot to come up and the decoded
    // cell to travel back down.
    h.run_until(80, |h| h.relay.stats().downstream_cells > 4);

    let receiver = (sender_idx + 1) % 3;
    let mut seen = false;
    for delivered in h.clients[receiver].take_delivered() {
        if delivered.starts_with(b"HELLO") {
            // No residue from the non-owners past the payload.
            assert!(delivered[5..].iter().all(|&b| b == 0));
            seen = true;
        }
    }
    assert!(seen, "decoded payload was broadcast back down");
}

#[test]
fn session_works_with_equivocation_protection() {
    let mut h = Harness::new(2, 2);
    let mut params = h.base_params(128);
    params.add_bool(keys::EQUIVOCATION_PROTECTION_ENABLED, true);
    h.start(params);
    h.run_setup();

    let sender_idx = h.client_with_slot(0);
    h.clients[sender_idx].queue_upstream_data(b"masked round trip");

    h.run_until(80, |h| h.relay.stats().downstream_cells > 4);

    let receiver = (sender_idx + 1) % 2;
    let delivered = h.clients[receiver].take_delivered();
    assert!(
        delivered
            .iter()
            .any(|d| d.starts_with(b"masked round trip")),
        "payload survives the equivocation mask"
    );
}

#[test]
fn session_works_over_udp_broadcast() {
    let mut h = Harness::new(2, 1);
    let mut params = h.base_params(64);
    params.add_bool(keys::USE_UDP, true);
    h.start(params);
    h.run_setup();

    let sender_idx = h.client_with_slot(0);
    h.clients[sender_idx].queue_upstream_data(b"over the air");
    h.run_until(60, |h| h.relay.stats().downstream_udp_cells > 4);

    let receiver = (sender_idx + 1) % 2;
    assert!(h.clients[receiver]
        .take_delivered()
        .iter()
        .any(|d| d.starts_with(b"over the air")));
}

#[test]
fn latency_test_cells_are_echoed_with_priority() {
    let mut h = Harness::new(2, 1);
    let params = h.base_params(64);
    h.start(params);
    h.run_setup();

    let sender_idx = h.client_with_slot(0);
    let mut probe = vec![0xAA, 0xAA];
    probe.extend_from_slice(b"latency probe");
    h.clients[sender_idx].queue_upstream_data(&probe);

    h.run_until(60, |h| h.relay.stats().downstream_cells > 4);

    let receiver = (sender_idx + 1) % 2;
    assert!(h.clients[receiver]
        .take_delivered()
        .iter()
        .any(|d| d.starts_with(&[0xAA, 0xAA])));
}

#[test]
fn experiment_round_limit_shuts_the_session_down() {
    let mut h = Harness::new(2, 1);
    let mut params = h.base_params(64);
    params.add_int(keys::EXPERIMENT_ROUND_LIMIT, 5);
    h.start(params);

    h.run_until(120, |h| h.relay.is_shutdown());
    h.pump_once();

    for client in &h.clients {
        assert!(client.is_shutdown());
    }
    for trustee in &h.trustees {
        assert!(trustee.is_shutdown());
    }
    assert!(h.relay.stats().rounds_closed <= 5);
}

// ============================================================================
// OPEN/CLOSED SLOT SCHEDULING
// ============================================================================

#[test]
fn open_closed_bitmap_schedules_only_requesting_slots() {
    let mut h = Harness::new(4, 1);
    let mut params = h.base_params(100);
    params.add_bool(keys::USE_OPEN_CLOSED_SLOTS, true);
    h.start(params);
    h.run_setup();

    // Slots 0 and 2 have data; 1 and 3 stay silent.
    let with_data = [h.client_with_slot(0), h.client_with_slot(2)];
    h.clients[with_data[0]].queue_upstream_data(b"from slot zero");
    h.clients[with_data[1]].queue_upstream_data(b"from slot two");

    h.run_until(120, |h| h.relay.stats().upstream_cells >= 2);
    h.run_until(60, |h| h.relay.stats().downstream_cells > 6);

    let silent = h.client_with_slot(1);
    let delivered = h.clients[silent].take_delivered();
    let texts: Vec<&[u8]> = delivered
        .iter()
        .map(|d| d.as_slice())
        .filter(|d| d.starts_with(b"from slot"))
        .collect();
    assert!(
        texts.iter().any(|d| d.starts_with(b"from slot zero")),
        "slot 0 payload delivered"
    );
    assert!(
        texts.iter().any(|d| d.starts_with(b"from slot two")),
        "slot 2 payload delivered"
    );
}

#[test]
fn all_closed_bitmap_requests_a_pause() {
    let mut h = Harness::new(2, 1);
    let mut params = h.base_params(64);
    params.add_bool(keys::USE_OPEN_CLOSED_SLOTS, true);
    params.add_int(keys::OPEN_CLOSED_SLOTS_MIN_DELAY_BETWEEN_REQUESTS, 250);
    h.start(params);
    h.run_setup();

    // Nobody queues data: the first bitmap comes back all zero and the
    // relay asks the host loop to back off.
    let mut pause = None;
    h.run_until(60, |h| h.relay.stats().rounds_closed >= 2);
    for _ in 0..60 {
        h.pump_once();
        for trustee in &mut h.trustees {
            if trustee.is_streaming() {
                trustee.stream_ciphers(1).unwrap();
            }
        }
        if let Some(p) = h.relay.take_requested_pause() {
            pause = Some(p);
            break;
        }
    }
    assert_eq!(pause, Some(std::time::Duration::from_millis(250)));
}

// ============================================================================
// RATE LIMITING
// ============================================================================

#[test]
fn trustee_streaming_is_throttled_and_resumed() {
    let mut h = Harness::new(1, 2);
    let mut params = h.base_params(64);
    params.add_int(keys::WINDOW_SIZE, 2);
    params.add_int(keys::RELAY_TRUSTEE_CACHE_LOW_BOUND, 3);
    params.add_int(keys::RELAY_TRUSTEE_CACHE_HIGH_BOUND, 5);
    h.start(params);
    h.run_setup();

    // Trustee 0 floods ciphers far ahead of the relay.
    h.trustees[0].stream_ciphers(8).unwrap();
    h.pump_once();
    assert_eq!(
        h.trustees[0].window_capacity(),
        0,
        "stop signal delivered once the cache crossed the high bound"
    );

    // As rounds close, the buffered-ahead count falls below the low
    // bound and the relay resumes the stream.
    h.run_until(120, |h| h.trustees[0].window_capacity() == 1);
    assert!(h.relay.stats().rate_changes_sent >= 2);
}

// ============================================================================
// LIVENESS
// ============================================================================

#[test]
fn unresponsive_client_is_excluded_after_timeout() {
    let mut h = Harness::new(2, 1);
    let mut params = h.base_params(64);
    params.add_int(keys::RELAY_ROUND_TIMEOUT, 0);
    params.add_int(keys::RELAY_MAX_NUMBER_OF_CONSECUTIVE_FAILED_ROUNDS, 10);
    h.start(params);
    h.run_setup();

    // Client 1 goes dark after setup. Stream generously so the trustee
    // is never the missing contributor, then let the stall settle.
    h.dead_clients.push(1);
    for _ in 0..5 {
        while h.pump_once() {}
        for trustee in &mut h.trustees {
            if trustee.is_streaming() {
                trustee.stream_ciphers(4).unwrap();
            }
        }
    }
    while h.pump_once() {}

    let rounds_before = h.relay.stats().rounds_closed;

    // T2 fires on the stalled round: the straggler is excluded and the
    // round completes with the survivors.
    h.relay.check_timeouts().unwrap();

    h.run_until(80, |h| h.relay.stats().rounds_closed > rounds_before + 3);
    assert!(h.relay.is_communicating(), "session survives the exclusion");
    assert!(h.relay.stats().rounds_skipped >= 1);
}

// ============================================================================
// DISRUPTION PROTECTION
// ============================================================================

#[test]
fn tampered_broadcast_triggers_echo_and_blame() {
    // The relay deliberately corrupts client 0's copy of every downstream
    // cell from round 3 on. The client notices the hash mismatch, asks
    // for an echo, compares the (also corrupted) retransmission with
    // what it sent, and raises a blame that the relay broadcasts.
    //
    // A larger window is requested on purpose: the echo retransmission
    // only lines up with the requesting round when one round is in
    // flight, so the relay must clamp the window to 1.
    let mut h = Harness::new(1, 1);
    let mut params = h.base_params(100);
    params.add_bool(keys::DISRUPTION_PROTECTION_ENABLED, true);
    params.add_bool(keys::FORCE_DISRUPTION_SINCE_ROUND_3, true);
    params.add_int(keys::WINDOW_SIZE, 3);
    h.start(params);
    h.run_setup();

    // A steady stream of distinct payloads so every round carries data.
    for round in 0..30 {
        h.clients[0].queue_upstream_data(format!("payload {round:02}").as_bytes());
    }

    h.run_until(300, |h| {
        h.log
            .iter()
            .any(|(dest, kind)| dest == "trustee 0" && *kind == "DisruptionReveal")
    });

    assert!(
        h.log
            .iter()
            .any(|(dest, kind)| dest == "client 0" && *kind == "DisruptionReveal"),
        "blame reveal reaches the clients too"
    );

    // The requested window of 3 was clamped: with one round in flight,
    // downstream cells never outrun the closed rounds (round 0 has no
    // cell of its own).
    let stats = h.relay.stats();
    assert!(stats.downstream_cells <= stats.rounds_closed);
}

// ============================================================================
// SHUFFLE FAILURE
// ============================================================================

#[test]
fn malformed_shuffle_proof_aborts_the_session() {
    // Drive the setup by hand so trustee 1's shuffle step can be
    // tampered with in flight. The relay must refuse it, shut the
    // session down and tell everyone.
    let mut h = Harness::new(2, 2);
    let params = h.base_params(100);
    h.start(params);

    let mut aborted = false;
    'outer: for _ in 0..60 {
        // Deliver relay-bound traffic one message at a time so the bad
        // step can be intercepted.
        while let Ok(msg) = h.net.relay_inbox().try_recv() {
            let msg = match msg {
                ProtocolMessage::ShuffleResult {
                    trustee_id: 1,
                    new_base,
                    new_relay_key,
                    new_eph_pks,
                    mut proof,
                } => {
                    proof.chain.response = [0x42; 32];
                    ProtocolMessage::ShuffleResult {
                        trustee_id: 1,
                        new_base,
                        new_relay_key,
                        new_eph_pks,
                        proof,
                    }
                }
                other => other,
            };
            let result = h.relay.process(msg);
            if h.relay.is_shutdown() {
                assert!(result.is_err(), "the rejected step surfaces as an error");
                aborted = true;
                break 'outer;
            }
        }
        for j in 0..h.trustees.len() {
            while let Ok(msg) = h.net.trustee_inbox(j as u16).try_recv() {
                h.trustees[j].process(msg).unwrap();
            }
        }
        for i in 0..h.clients.len() {
            while let Ok(msg) = h.net.client_inbox(i as ClientId).try_recv() {
                h.clients[i].process(msg).unwrap();
            }
        }
    }

    assert!(aborted, "relay rejected the malformed proof");

    // The shutdown broadcast reaches every peer.
    for j in 0..h.trustees.len() {
        let mut saw_shutdown = false;
        while let Ok(msg) = h.net.trustee_inbox(j as u16).try_recv() {
            if matches!(msg, ProtocolMessage::Shutdown) {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown, "trustee {j} told to shut down");
    }
}

// ============================================================================
// WINDOWING
// ============================================================================

#[test]
fn window_keeps_multiple_rounds_in_flight() {
    let mut h = Harness::new(2, 1);
    let mut params = h.base_params(64);
    params.add_int(keys::WINDOW_SIZE, 3);
    h.start(params);
    h.run_setup();

    h.run_until(100, |h| h.relay.stats().rounds_closed >= 6);

    // Downstream always runs ahead of the closed rounds, bounded by the
    // window.
    let stats = h.relay.stats();
    let sent = stats.downstream_cells + stats.downstream_udp_cells;
    assert!(sent >= stats.rounds_closed);
    assert!(sent <= stats.rounds_closed + 3 + 1);
}
