// In-memory star network
//
// One unbounded FIFO channel per destination plus a broadcast path that
// fans out to subscribed clients, standing in for UDP. Every message is
// pushed through the wire codec on the way, so frame limits hold exactly
// as they would on a socket.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tracing::trace;

use super::{MessageSender, TransportError};
use crate::message::{codec, ProtocolMessage};
use crate::{ClientId, TrusteeId};

struct Destination {
    tx: Sender<ProtocolMessage>,
    connected: RwLock<bool>,
}

impl Destination {
    fn new(tx: Sender<ProtocolMessage>) -> Self {
        Destination {
            tx,
            connected: RwLock::new(true),
        }
    }
}

struct Shared {
    relay: Destination,
    clients: Vec<Destination>,
    trustees: Vec<Destination>,
    /// Which clients currently listen on the broadcast path.
    broadcast_listeners: RwLock<Vec<bool>>,
}

/// The in-memory network. Cloning shares the same star.
#[derive(Clone)]
pub struct LocalNetwork {
    shared: Arc<Shared>,
    relay_rx: Receiver<ProtocolMessage>,
    client_rxs: Vec<Receiver<ProtocolMessage>>,
    trustee_rxs: Vec<Receiver<ProtocolMessage>>,
}

impl LocalNetwork {
    pub fn new(n_clients: usize, n_trustees: usize) -> Self {
        let (relay_tx, relay_rx) = unbounded();
        let (client_txs, client_rxs): (Vec<_>, Vec<_>) =
            (0..n_clients).map(|_| unbounded()).unzip();
        let (trustee_txs, trustee_rxs): (Vec<_>, Vec<_>) =
            (0..n_trustees).map(|_| unbounded()).unzip();

        LocalNetwork {
            shared: Arc::new(Shared {
                relay: Destination::new(relay_tx),
                clients: client_txs.into_iter().map(Destination::new).collect(),
                trustees: trustee_txs.into_iter().map(Destination::new).collect(),
                broadcast_listeners: RwLock::new(vec![true; n_clients]),
            }),
            relay_rx,
            client_rxs,
            trustee_rxs,
        }
    }

    /// Inbound queue of the relay role.
    pub fn relay_inbox(&self) -> Receiver<ProtocolMessage> {
        self.relay_rx.clone()
    }

    /// Inbound queue of client `i`.
    pub fn client_inbox(&self, id: ClientId) -> Receiver<ProtocolMessage> {
        self.client_rxs[id as usize].clone()
    }

    /// Inbound queue of trustee `j`.
    pub fn trustee_inbox(&self, id: TrusteeId) -> Receiver<ProtocolMessage> {
        self.trustee_rxs[id as usize].clone()
    }

    /// Subscribe a client to the broadcast path. The returned handle
    /// starts and stops the listener, standing in for the UDP helper loop.
    pub fn client_subscribe_to_broadcast(&self, id: ClientId) -> BroadcastSubscription {
        BroadcastSubscription {
            shared: Arc::clone(&self.shared),
            client: id,
        }
    }

    /// Mark a peer connection as gone; subsequent sends to it fail.
    pub fn disconnect_client(&self, id: ClientId) {
        if let Some(dest) = self.shared.clients.get(id as usize) {
            *dest.connected.write() = false;
        }
    }

    pub fn disconnect_trustee(&self, id: TrusteeId) {
        if let Some(dest) = self.shared.trustees.get(id as usize) {
            *dest.connected.write() = false;
        }
    }

    /// Serialize + reparse, as the wire would. Frame limits apply here.
    fn through_codec(msg: &ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        let frame = codec::encode_frame(msg)?;
        let (restored, _) = codec::decode_frame(&frame)?;
        Ok(restored)
    }

    fn deliver(dest: &Destination, what: &str, msg: &ProtocolMessage) -> Result<(), TransportError> {
        if !*dest.connected.read() {
            return Err(TransportError::Disconnected(what.to_string()));
        }
        let msg = Self::through_codec(msg)?;
        trace!(to = what, kind = msg.message_type(), "deliver");
        dest.tx
            .send(msg)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl MessageSender for LocalNetwork {
    fn send_to_client(&self, id: ClientId, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let dest = self
            .shared
            .clients
            .get(id as usize)
            .ok_or_else(|| TransportError::UnknownDestination(format!("client {id}")))?;
        Self::deliver(dest, &format!("client {id}"), msg)
    }

    fn send_to_trustee(&self, id: TrusteeId, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let dest = self
            .shared
            .trustees
            .get(id as usize)
            .ok_or_else(|| TransportError::UnknownDestination(format!("trustee {id}")))?;
        Self::deliver(dest, &format!("trustee {id}"), msg)
    }

    fn send_to_relay(&self, msg: &ProtocolMessage) -> Result<(), TransportError> {
        Self::deliver(&self.shared.relay, "relay", msg)
    }

    fn broadcast_to_all_clients(&self, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let listeners = self.shared.broadcast_listeners.read();
        for (id, dest) in self.shared.clients.iter().enumerate() {
            if !listeners[id] || !*dest.connected.read() {
                continue;
            }
            Self::deliver(dest, &format!("client {id} (broadcast)"), msg)?;
        }
        Ok(())
    }
}

/// Start/stop handle for one client's broadcast listener.
pub struct BroadcastSubscription {
    shared: Arc<Shared>,
    client: ClientId,
}

impl BroadcastSubscription {
    pub fn start(&self) {
        self.shared.broadcast_listeners.write()[self.client as usize] = true;
    }

    pub fn stop(&self) {
        self.shared.broadcast_listeners.write()[self.client as usize] = false;
    }
}
