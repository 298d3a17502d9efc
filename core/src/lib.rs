// StarCloak Core — DC-net protocol engine
//
// One relay, N clients, M trustees in a star. Clients send anonymized
// upstream traffic in fixed-size cells; each round the relay XOR-combines
// the contributions of every client and trustee into one plaintext cell
// and broadcasts downstream to all clients.

pub mod client;
pub mod config;
pub mod crypto;
pub mod dcnet;
pub mod message;
pub mod relay;
pub mod scheduler;
pub mod statemachine;
pub mod transport;
pub mod trustee;

use thiserror::Error;

/// Round counter. Round 0 is the setup-complete boundary; normal traffic
/// rounds start at 1.
pub type RoundId = u32;

/// Client index in `[0, n_clients)`.
pub type ClientId = u16;

/// Trustee index in `[0, n_trustees)`.
pub type TrusteeId = u16;

/// Position of an ephemeral key in the shuffled list. The slot is the
/// client's pseudonym for the session.
pub type SlotId = u16;

pub use client::ClientRole;
pub use config::SessionConfig;
pub use dcnet::DcNetEntity;
pub use message::ProtocolMessage;
pub use relay::RelayRole;
pub use transport::{LocalNetwork, MessageSender};
pub use trustee::TrusteeRole;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Crate-level error umbrella. Every role handler returns this; nothing
/// crosses a role boundary untyped.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
    #[error(transparent)]
    DcNet(#[from] dcnet::DcNetError),
    #[error(transparent)]
    Message(#[from] message::MessageError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Shuffle(#[from] scheduler::ShuffleError),
    #[error(transparent)]
    Schedule(#[from] scheduler::slots::ScheduleError),
    #[error(transparent)]
    Round(#[from] relay::rounds::RoundError),
    #[error(transparent)]
    State(#[from] statemachine::StateError),

    /// A message arrived that the role cannot accept in its current state.
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },
    /// A peer id outside the session membership.
    #[error("unknown peer id {0}")]
    UnknownPeer(u16),
    /// The session cannot continue and has been shut down.
    #[error("session aborted: {0}")]
    SessionAborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_error_displays_context() {
        let err = CoreError::UnexpectedMessage {
            message: "TrusteePublicKey",
            state: "COMMUNICATING",
        };
        assert_eq!(
            err.to_string(),
            "unexpected TrusteePublicKey in state COMMUNICATING"
        );

        let err = CoreError::UnknownPeer(7);
        assert!(err.to_string().contains('7'));
    }
}
