use crate::network::connection_manager::ConnectionDirection;
use crate::network::message::Payload;
use crate::types::NodeId;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ResponseSender = oneshot::Sender<Payload>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHandshake,
    Completed,
    /// Closed before or after completion; the record is about to go away.
    TimedOut,
}

/// Snapshot of a live connection
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: String,
    pub remote_address: SocketAddr,
    pub direction: ConnectionDirection,
    pub connected_at: Instant,
    pub last_activity_at: Instant,
    pub handshake_state: HandshakeState,
    pub node_id: Option<NodeId>,
    pub advertised_features: Vec<String>,
    pub advertised_height: u64,
    pub api_endpoint: Option<String>,
    pub listen_address: Option<String>,
    pub udp_port: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

impl PeerConnection {
    pub fn new(peer_id: String, remote_address: SocketAddr, direction: ConnectionDirection) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            remote_address,
            direction,
            connected_at: now,
            last_activity_at: now,
            handshake_state: HandshakeState::AwaitingHandshake,
            node_id: None,
            advertised_features: Vec::new(),
            advertised_height: 0,
            api_endpoint: None,
            listen_address: None,
            udp_port: None,
            bytes_in: 0,
            bytes_out: 0,
            messages_in: 0,
            messages_out: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handshake_state == HandshakeState::Completed
    }

    /// Datagram address, when the peer advertised a UDP port.
    pub fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_port
            .map(|port| SocketAddr::new(self.remote_address.ip(), port))
    }
}

struct PeerEntry {
    info: PeerConnection,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Registry of active peer connections with ability to send targeted messages
pub struct PeerConnectionRegistry {
    connections: RwLock<HashMap<String, PeerEntry>>,
    /// Pending responses keyed by (peer, expected response type)
    pending_responses: Mutex<HashMap<(String, &'static str), Vec<ResponseSender>>>,
}

impl PeerConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
        }
    }

    /// Register a peer connection
    pub fn register_peer(
        &self,
        info: PeerConnection,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) {
        let peer_id = info.peer_id.clone();
        self.connections.write().insert(
            peer_id.clone(),
            PeerEntry {
                info,
                outbound,
                cancel,
            },
        );
        debug!("✅ Registered peer connection: {}", peer_id);
    }

    /// Unregister a peer connection and fail its pending requests
    pub fn unregister_peer(&self, peer_id: &str) -> Option<PeerConnection> {
        let removed = self.connections.write().remove(peer_id);
        // Dropping the senders wakes waiters with RecvError
        self.pending_responses
            .lock()
            .retain(|(peer, _), _| peer != peer_id);
        debug!("🔌 Unregistered peer connection: {}", peer_id);
        removed.map(|entry| {
            let mut info = entry.info;
            info.handshake_state = HandshakeState::TimedOut;
            info
        })
    }

    pub fn update<F: FnOnce(&mut PeerConnection)>(&self, peer_id: &str, f: F) -> bool {
        match self.connections.write().get_mut(peer_id) {
            Some(entry) => {
                f(&mut entry.info);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerConnection> {
        self.connections
            .read()
            .get(peer_id)
            .map(|entry| entry.info.clone())
    }

    pub fn outbound_queue(&self, peer_id: &str) -> Option<mpsc::Sender<Bytes>> {
        self.connections
            .read()
            .get(peer_id)
            .map(|entry| entry.outbound.clone())
    }

    /// Force-close a connection. Returns false if it is not registered.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        match self.connections.read().get(peer_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_connected_peers(&self) -> Vec<PeerConnection> {
        self.connections
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Peers that completed the handshake
    pub fn ready_peers(&self) -> Vec<PeerConnection> {
        self.connections
            .read()
            .values()
            .filter(|entry| entry.info.is_ready())
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.connections.read().len()
    }

    /// True if some connection reaches `address`, by dial address or advertised listen address.
    pub fn is_connected_to(&self, address: &str) -> bool {
        self.connections.read().values().any(|entry| {
            entry.info.peer_id == address
                || entry.info.listen_address.as_deref() == Some(address)
        })
    }

    pub fn find_by_node_id(&self, node_id: &NodeId) -> Option<String> {
        self.connections
            .read()
            .values()
            .find(|entry| entry.info.node_id.as_ref() == Some(node_id))
            .map(|entry| entry.info.peer_id.clone())
    }

    /// Register interest in the next `response_type` payload from `peer_id`.
    pub fn register_waiter(
        &self,
        peer_id: &str,
        response_type: &'static str,
    ) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.pending_responses
            .lock()
            .entry((peer_id.to_string(), response_type))
            .or_default()
            .push(tx);
        rx
    }

    /// Route a response to the oldest waiter. Hands the payload back if nobody was waiting.
    pub fn handle_response(&self, peer_id: &str, payload: Payload) -> Option<Payload> {
        let key = (peer_id.to_string(), payload.message_type());
        let mut pending = self.pending_responses.lock();
        let mut payload = payload;
        if let Some(waiters) = pending.get_mut(&key) {
            while !waiters.is_empty() {
                let waiter = waiters.remove(0);
                match waiter.send(payload) {
                    Ok(()) => {
                        if waiters.is_empty() {
                            pending.remove(&key);
                        }
                        return None;
                    }
                    // Waiter timed out and dropped its receiver; try the next one
                    Err(returned) => payload = returned,
                }
            }
            pending.remove(&key);
        }
        Some(payload)
    }

    /// Drop waiters whose requester already gave up
    pub fn prune_waiters(&self) -> usize {
        let mut pending = self.pending_responses.lock();
        let before: usize = pending.values().map(Vec::len).sum();
        pending.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
        before - pending.values().map(Vec::len).sum::<usize>()
    }

    pub fn pending_response_count(&self) -> usize {
        self.pending_responses.lock().values().map(Vec::len).sum()
    }

    /// Cancel every connection (shutdown)
    pub fn disconnect_all(&self) {
        for entry in self.connections.read().values() {
            entry.cancel.cancel();
        }
    }
}

impl Default for PeerConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &PeerConnectionRegistry, peer_id: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(4);
        let info = PeerConnection::new(
            peer_id.to_string(),
            peer_id.parse().unwrap(),
            ConnectionDirection::Outbound,
        );
        registry.register_peer(info, tx, CancellationToken::new());
        rx
    }

    #[tokio::test]
    async fn test_response_routed_to_waiter() {
        let registry = PeerConnectionRegistry::new();
        let _rx = register(&registry, "10.0.0.1:9333");

        let waiter = registry.register_waiter("10.0.0.1:9333", "peers");
        let unrelated = Payload::Chain { blocks: vec![] };
        assert!(registry
            .handle_response("10.0.0.1:9333", unrelated)
            .is_some());

        let response = Payload::Peers {
            addresses: vec!["10.0.0.9:9333".into()],
        };
        assert!(registry
            .handle_response("10.0.0.1:9333", response.clone())
            .is_none());
        assert_eq!(waiter.await.unwrap(), response);
        assert_eq!(registry.pending_response_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let registry = PeerConnectionRegistry::new();
        let _rx = register(&registry, "10.0.0.1:9333");

        drop(registry.register_waiter("10.0.0.1:9333", "peers"));
        let live = registry.register_waiter("10.0.0.1:9333", "peers");

        let response = Payload::Peers { addresses: vec![] };
        assert!(registry
            .handle_response("10.0.0.1:9333", response)
            .is_none());
        assert!(live.await.is_ok());
    }

    #[tokio::test]
    async fn test_unregister_fails_pending_and_marks_closed() {
        let registry = PeerConnectionRegistry::new();
        let _rx = register(&registry, "10.0.0.2:9333");
        let waiter = registry.register_waiter("10.0.0.2:9333", "chain");

        let info = registry.unregister_peer("10.0.0.2:9333").unwrap();
        assert_eq!(info.handshake_state, HandshakeState::TimedOut);
        assert!(waiter.await.is_err());
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_ready_peers_and_listen_lookup() {
        let registry = PeerConnectionRegistry::new();
        let _a = register(&registry, "10.0.0.3:40000");
        let _b = register(&registry, "10.0.0.4:9333");

        registry.update("10.0.0.3:40000", |info| {
            info.handshake_state = HandshakeState::Completed;
            info.listen_address = Some("10.0.0.3:9333".to_string());
        });

        assert_eq!(registry.ready_peers().len(), 1);
        assert!(registry.is_connected_to("10.0.0.3:9333"));
        assert!(registry.is_connected_to("10.0.0.4:9333"));
        assert!(!registry.is_connected_to("10.0.0.5:9333"));
    }
}
