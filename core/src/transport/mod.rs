//! Transport abstraction — how roles reach each other
//!
//! The core never opens sockets itself; it talks through `MessageSender`.
//! Delivery must be FIFO per destination. TCP unicast, UDP broadcast and
//! in-memory channels are all valid implementations; the crate ships the
//! in-memory star network used by the integration tests.

pub mod local;

use thiserror::Error;

use crate::message::{MessageError, ProtocolMessage};
use crate::{ClientId, TrusteeId};

pub use local::{BroadcastSubscription, LocalNetwork};

/// Transport error types
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
    #[error("destination disconnected: {0}")]
    Disconnected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error(transparent)]
    Codec(#[from] MessageError),
}

/// Outbound half of the star. One instance is handed to each role at
/// construction; roles never talk to each other except through it.
pub trait MessageSender {
    /// Unicast to client `i`.
    fn send_to_client(&self, id: ClientId, msg: &ProtocolMessage) -> Result<(), TransportError>;

    /// Unicast to trustee `j`.
    fn send_to_trustee(&self, id: TrusteeId, msg: &ProtocolMessage) -> Result<(), TransportError>;

    /// Unicast to the relay.
    fn send_to_relay(&self, msg: &ProtocolMessage) -> Result<(), TransportError>;

    /// Broadcast fast path to every subscribed client.
    fn broadcast_to_all_clients(&self, msg: &ProtocolMessage) -> Result<(), TransportError>;
}
