// Event Transport
//
// Delivery of server events to connections: fan-out to everyone, unicast to
// one identifier, and forced close. The WebSocket server drives the receiving
// ends; the coordinator only sees the `Transport` trait.

use crate::protocol::ServerEvent;
use crate::session::ConnectionId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver to every connection attached at the moment of the call.
    /// Returns the number of receivers reached.
    async fn broadcast(&self, event: ServerEvent) -> usize;

    /// Deliver to one connection. `false` if it is no longer attached.
    async fn send_to(&self, id: &ConnectionId, event: ServerEvent) -> bool;

    /// Ask a connection to shut down. `false` if it is no longer attached.
    async fn close(&self, id: &ConnectionId) -> bool;
}

/// Per-connection instruction from the transport to its socket task
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Deliver(ServerEvent),
    Close,
}

/// Channel-backed transport: one unbounded directive queue per connection.
///
/// A slow socket buffers instead of skipping events, so only a connection
/// that joins or leaves mid-broadcast can miss one.
pub struct ChannelTransport {
    peers: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Directive>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection; its socket task drains the returned queue
    pub async fn attach(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<Directive> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(id, tx);
        rx
    }

    pub async fn detach(&self, id: &ConnectionId) {
        self.peers.write().await.remove(id);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn direct(&self, id: &ConnectionId, directive: Directive) -> bool {
        let peers = self.peers.read().await;
        match peers.get(id) {
            Some(tx) => tx.send(directive).is_ok(),
            None => false,
        }
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn broadcast(&self, event: ServerEvent) -> usize {
        // The read guard pins the recipient set for the whole fan-out
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|tx| tx.send(Directive::Deliver(event.clone())).is_ok())
            .count()
    }

    async fn send_to(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        self.direct(id, Directive::Deliver(event)).await
    }

    async fn close(&self, id: &ConnectionId) -> bool {
        self.direct(id, Directive::Close).await
    }
}
