//! Trustee role — shuffle participant and cipher streamer
//!
//! A trustee registers its key, performs its shuffle step when the chain
//! reaches it, verifies the full transcript before signing, then streams
//! DC-net ciphers ahead of the relay's rounds. The relay throttles the
//! stream with rate-change messages; a stopped trustee sends nothing
//! until resumed.

use curve25519_dalek::ristretto::RistrettoPoint;
use rand::rngs::OsRng;
use tracing::{debug, error, info};

use crate::config::{keys, SessionConfig};
use crate::crypto::{point_from_bytes, Keypair, SharedSecret};
use crate::dcnet::{DcNetEntity, DcNetRole};
use crate::message::{ParametersMessage, ProtocolMessage, ShuffleTranscript};
use crate::scheduler::TrusteeShuffleView;
use crate::statemachine::{RoleState, StateMachine};
use crate::transport::MessageSender;
use crate::{CoreError, RoundId, TrusteeId};

/// The trustee's session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrusteeState {
    Idle,
    KeysExchanged,
    ShuffleDone,
    Streaming,
    Shutdown,
}

impl RoleState for TrusteeState {
    fn name(&self) -> &'static str {
        match self {
            TrusteeState::Idle => "IDLE",
            TrusteeState::KeysExchanged => "KEYS_EXCHANGED",
            TrusteeState::ShuffleDone => "SHUFFLE_DONE",
            TrusteeState::Streaming => "STREAMING",
            TrusteeState::Shutdown => "SHUTDOWN",
        }
    }

    fn can_transition(&self, to: &Self) -> bool {
        use TrusteeState::*;
        matches!(
            (self, to),
            (Idle, KeysExchanged)
                | (KeysExchanged, ShuffleDone)
                | (ShuffleDone, Streaming)
                | (_, Shutdown)
        )
    }
}

pub struct TrusteeRole<S: MessageSender> {
    sender: S,
    trustee_id: TrusteeId,
    keypair: Keypair,
    config: SessionConfig,
    state: StateMachine<TrusteeState>,

    shuffle: TrusteeShuffleView,
    client_pks: Vec<RistrettoPoint>,
    dcnet: Option<DcNetEntity>,

    /// Streaming window granted by the relay; 0 means stopped.
    window_capacity: u32,
    next_round_to_send: RoundId,
}

impl<S: MessageSender> TrusteeRole<S> {
    pub fn new(trustee_id: TrusteeId, keypair: Keypair, sender: S) -> Self {
        TrusteeRole {
            sender,
            trustee_id,
            keypair,
            config: SessionConfig::default(),
            state: StateMachine::new("trustee", TrusteeState::Idle),
            shuffle: TrusteeShuffleView::new(trustee_id),
            client_pks: Vec::new(),
            dcnet: None,
            window_capacity: 1,
            next_round_to_send: 0,
        }
    }

    // ------------------------------------------------------------------------
    // INSPECTION & HOST HOOKS
    // ------------------------------------------------------------------------

    pub fn trustee_id(&self) -> TrusteeId {
        self.trustee_id
    }

    pub fn state_name(&self) -> &'static str {
        self.state.state_name()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.is(TrusteeState::Shutdown)
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is(TrusteeState::Streaming)
    }

    pub fn window_capacity(&self) -> u32 {
        self.window_capacity
    }

    /// Produce and push up to `count` ciphers, observing the granted
    /// window. The host loop calls this to keep the stream ahead of the
    /// relay.
    pub fn stream_ciphers(&mut self, count: usize) -> Result<(), CoreError> {
        if !self.state.is(TrusteeState::Streaming) || self.window_capacity == 0 {
            return Ok(());
        }
        let dcnet = self.dcnet.as_mut().expect("streaming implies entity");
        for _ in 0..count {
            let round_id = self.next_round_to_send;
            let data = dcnet.encode_for_round(round_id, false, None, false)?;
            self.sender.send_to_relay(&ProtocolMessage::TrusteeCipher {
                trustee_id: self.trustee_id,
                round_id,
                data,
            })?;
            self.next_round_to_send += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // DISPATCH
    // ------------------------------------------------------------------------

    pub fn process(&mut self, msg: ProtocolMessage) -> Result<(), CoreError> {
        if self.state.is(TrusteeState::Shutdown) {
            return Ok(());
        }
        match msg {
            ProtocolMessage::Parameters(p) => self.on_parameters(p),
            ProtocolMessage::Shutdown => {
                info!(trustee = self.trustee_id, "trustee shutting down");
                self.state.transition(TrusteeState::Shutdown)?;
                Ok(())
            }
            ProtocolMessage::ShuffleRequest {
                client_pks,
                eph_pks,
                base,
                relay_key,
            } => self.on_shuffle_request(client_pks, eph_pks, base, relay_key),
            ProtocolMessage::ShuffleTranscript(t) => self.on_transcript(t),
            ProtocolMessage::RateChange { window_capacity } => {
                debug!(
                    trustee = self.trustee_id,
                    window_capacity, "rate change received"
                );
                let resumed = self.window_capacity == 0 && window_capacity > 0;
                self.window_capacity = window_capacity;
                if resumed {
                    self.stream_ciphers(window_capacity as usize)?;
                }
                Ok(())
            }
            ProtocolMessage::DisruptionReveal { round_id, bit_pos } => {
                info!(
                    trustee = self.trustee_id,
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
    // HANDLERS
    // ------------------------------------------------------------------------

    fn on_parameters(&mut self, msg: ParametersMessage) -> Result<(), CoreError> {
        if !self.state.is(TrusteeState::Idle) && !msg.force_params {
            return Err(CoreError::UnexpectedMessage {
                message: "Parameters",
                state: self.state.state_name(),
            });
        }

        self.config = self.config.merged_with(&msg.params);
        self.trustee_id = msg
            .params
            .int_or(keys::NEXT_FREE_TRUSTEE_ID, i64::from(self.trustee_id))
            as TrusteeId;
        self.shuffle = TrusteeShuffleView::new(self.trustee_id);

        info!(trustee = self.trustee_id, "registering key");
        self.sender
            .send_to_relay(&ProtocolMessage::TrusteePublicKey {
                trustee_id: self.trustee_id,
                pk: self.keypair.public_bytes(),
            })?;
        self.state.transition(TrusteeState::KeysExchanged)?;
        Ok(())
    }

    fn on_shuffle_request(
        &mut self,
        client_pks: Vec<[u8; 32]>,
        eph_pks: Vec<[u8; 32]>,
        base: [u8; 32],
        relay_key: [u8; 32],
    ) -> Result<(), CoreError> {
        if !self.state.is(TrusteeState::KeysExchanged) {
            return Err(CoreError::UnexpectedMessage {
                message: "ShuffleRequest",
                state: self.state.state_name(),
            });
        }

        // The client long-term keys seed this trustee's pairwise pads.
        self.client_pks = client_pks
            .iter()
            .map(point_from_bytes)
            .collect::<Result<Vec<_>, _>>()?;

        let (new_base, new_relay_key, new_eph_pks, proof) =
            self.shuffle
                .perform_step(&base, &relay_key, &eph_pks, &mut OsRng)?;
        self.sender.send_to_relay(&ProtocolMessage::ShuffleResult {
            trustee_id: self.trustee_id,
            new_base,
            new_relay_key,
            new_eph_pks,
            proof,
        })?;
        self.state.transition(TrusteeState::ShuffleDone)?;
        Ok(())
    }

    fn on_transcript(&mut self, transcript: ShuffleTranscript) -> Result<(), CoreError> {
        if !self.state.is(TrusteeState::ShuffleDone) {
            return Err(CoreError::UnexpectedMessage {
                message: "ShuffleTranscript",
                state: self.state.state_name(),
            });
        }

        // A transcript that does not verify is never signed; the relay's
        // setup then starves and times out.
        let sig = match self
            .shuffle
            .verify_transcript_and_sign(&transcript, &self.keypair, &mut OsRng)
        {
            Ok(sig) => sig,
            Err(e) => {
                error!(trustee = self.trustee_id, error = %e, "transcript rejected, not signing");
                return Err(e.into());
            }
        };

        self.sender
            .send_to_relay(&ProtocolMessage::TranscriptSignature {
                trustee_id: self.trustee_id,
                sig,
            })?;

        let secrets: Vec<SharedSecret> = self
            .client_pks
            .iter()
            .map(|pk| SharedSecret::for_pads(&self.keypair, pk))
            .collect();
        self.dcnet = Some(DcNetEntity::new(
            self.trustee_id,
            DcNetRole::Trustee,
            self.config.payload_size,
            self.config.equivocation_protection,
            self.config.disruption_protection,
            secrets,
            None,
        )?);
        self.state.transition(TrusteeState::Streaming)?;

        // Open the stream with the initial window.
        self.stream_ciphers(self.window_capacity as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterMap;
    use crate::transport::LocalNetwork;
    use rand::rngs::OsRng;

    fn params_for(trustee_id: i64) -> ProtocolMessage {
        let mut params = ParameterMap::new();
        params.add_int(keys::NEXT_FREE_TRUSTEE_ID, trustee_id);
        params.add_int(keys::PAYLOAD_SIZE, 64);
        params.add_int(keys::N_CLIENTS, 1);
        params.add_int(keys::N_TRUSTEES, 1);
        ProtocolMessage::Parameters(ParametersMessage {
            params,
            force_params: true,
            trustees_pks: Vec::new(),
            relay_pk: None,
        })
    }

    #[test]
    fn parameters_trigger_key_registration() {
        let net = LocalNetwork::new(1, 1);
        let kp = Keypair::generate(&mut OsRng);
        let expected_pk = kp.public_bytes();
        let mut trustee = TrusteeRole::new(0, kp, net.clone());

        trustee.process(params_for(3)).unwrap();
        assert_eq!(trustee.trustee_id(), 3);
        assert_eq!(trustee.state_name(), "KEYS_EXCHANGED");

        match net.relay_inbox().try_recv().unwrap() {
            ProtocolMessage::TrusteePublicKey { trustee_id, pk } => {
                assert_eq!(trustee_id, 3);
                assert_eq!(pk, expected_pk);
            }
            other => panic!("wrong message: {}", other.message_type()),
        }
    }

    #[test]
    fn rate_change_zero_stops_the_stream() {
        let net = LocalNetwork::new(1, 1);
        let mut trustee = TrusteeRole::new(0, Keypair::generate(&mut OsRng), net.clone());
        trustee.process(params_for(0)).unwrap();

        trustee
            .process(ProtocolMessage::RateChange { window_capacity: 0 })
            .unwrap();
        assert_eq!(trustee.window_capacity(), 0);

        // Not streaming yet anyway, but even once streaming the window
        // gate holds.
        trustee.stream_ciphers(5).unwrap();
        while let Ok(msg) = net.relay_inbox().try_recv() {
            assert!(!matches!(msg, ProtocolMessage::TrusteeCipher { .. }));
        }
    }

    #[test]
    fn shuffle_request_before_parameters_is_rejected() {
        let net = LocalNetwork::new(1, 1);
        let mut trustee = TrusteeRole::new(0, Keypair::generate(&mut OsRng), net);
        let result = trustee.process(ProtocolMessage::ShuffleRequest {
            client_pks: vec![],
            eph_pks: vec![],
            base: [0u8; 32],
            relay_key: [0u8; 32],
        });
        assert!(matches!(result, Err(CoreError::UnexpectedMessage { .. })));
    }
}
