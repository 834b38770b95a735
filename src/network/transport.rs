//! Stream transport: connection setup, targeted sends, broadcast and
//! request/response on top of the per-connection sessions.
//!
//! Every outbound payload is sealed by the [`SecurityGate`] and charged to
//! the outbound budget before it is queued for a connection's writer.
//! Inbound traffic surfaces as [`TransportEvent`]s on the channel returned
//! by [`Transport::new`].

use crate::config::Config;
use crate::config::TransportConfig;
use crate::ledger::Ledger;
use crate::network::connection_manager::{ConnectionDirection, ConnectionLimits, ConnectionManager};
use crate::network::envelope::EnvelopeError;
use crate::network::message::{Handshake, Payload};
use crate::network::peer_connection::{read_loop, write_loop, CloseReason, PeerSession};
use crate::network::peer_connection_registry::{PeerConnection, PeerConnectionRegistry};
use crate::network::security::{SecurityError, SecurityGate};
use crate::network::tls::{BoxedStream, PeerStream, TlsConfig, TlsError, TrustStore};
use crate::network::wire::encode_frame;
use crate::types::NodeId;
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("connection to {0} closed")]
    Closed(String),
    #[error("{0} is banned: {1}")]
    Banned(IpAddr, String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("already dialing {0}")]
    AlreadyDialing(String),
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("framing error: {0}")]
    Frame(String),
    #[error("{0} is not a request")]
    NotARequest(&'static str),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an inbound message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Stream,
    Datagram,
    Http,
}

/// A verified payload ready for dispatch.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer_id: String,
    pub remote_address: SocketAddr,
    pub sender: NodeId,
    pub origin: Origin,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake completed on a connection.
    PeerReady(PeerConnection),
    /// A peer refreshed its advertised height (re-handshake or pong).
    PeerHeight { peer_id: String, height: u64 },
    Message(InboundMessage),
    Disconnected {
        peer_id: String,
        remote_address: SocketAddr,
        reason: CloseReason,
    },
}

/// What this node tells peers about itself in the handshake.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub api_endpoint: Option<String>,
    pub listen_address: Option<String>,
    pub udp_port: Option<u16>,
}

impl Advertisement {
    pub fn from_config(config: &Config) -> Self {
        let network = &config.network;
        Self {
            api_endpoint: network.api_endpoint.clone(),
            listen_address: network
                .external_address
                .clone()
                .or_else(|| Some(network.listen_address.clone())),
            udp_port: network
                .udp_listen_address
                .as_deref()
                .and_then(|addr| addr.parse::<SocketAddr>().ok())
                .map(|addr| addr.port()),
        }
    }
}

pub struct Transport {
    pub(crate) config: TransportConfig,
    pub(crate) gate: Arc<SecurityGate>,
    pub(crate) registry: Arc<PeerConnectionRegistry>,
    pub(crate) connections: Arc<ConnectionManager>,
    ledger: Arc<dyn Ledger>,
    tls: Option<TlsConfig>,
    advertisement: Advertisement,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Transport {
    pub fn new(
        config: &Config,
        gate: Arc<SecurityGate>,
        ledger: Arc<dyn Ledger>,
        tls: Option<TlsConfig>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Arc::new(Self {
            config: config.transport.clone(),
            gate,
            registry: Arc::new(PeerConnectionRegistry::new()),
            connections: Arc::new(ConnectionManager::new(ConnectionLimits::from_config(
                &config.network,
            ))),
            ledger,
            tls,
            advertisement: Advertisement::from_config(config),
            events,
            shutdown,
        });
        (transport, rx)
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<PeerConnectionRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The dialable address we advertise, if any.
    pub fn advertised_address(&self) -> Option<String> {
        self.advertisement.listen_address.clone()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn trust_store(&self) -> Option<Arc<TrustStore>> {
        self.tls.as_ref().map(|tls| tls.trust_store().clone())
    }

    pub(crate) async fn emit(&self, event: TransportEvent) {
        // The node may already be shutting down
        let _ = self.events.send(event).await;
    }

    /// Hand a verified message from another transport to the dispatcher.
    pub async fn deliver(&self, message: InboundMessage) {
        self.emit(TransportEvent::Message(message)).await;
    }

    pub async fn local_height(&self) -> u64 {
        self.ledger.height().await
    }

    pub async fn handshake_payload(&self) -> Payload {
        Payload::Handshake(Handshake {
            version: self.gate.protocol_version(),
            features: self.gate.features().to_vec(),
            node_id: self.gate.node_id(),
            height: self.local_height().await,
            api_endpoint: self.advertisement.api_endpoint.clone(),
            listen_address: self.advertisement.listen_address.clone(),
            udp_port: self.advertisement.udp_port,
        })
    }

    fn refuse_if_banned(&self, ip: IpAddr) -> Result<(), TransportError> {
        match self.gate.is_banned(ip) {
            Some(reason) => Err(TransportError::Banned(ip, reason)),
            None => Ok(()),
        }
    }

    /// Admit an inbound TCP connection.
    pub async fn accept(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<PeerConnection, TransportError> {
        let ip = remote.ip();
        if let Err(e) = self.refuse_if_banned(ip) {
            self.gate.report_refused(ip, e.to_string());
            return Err(e);
        }
        if let Err(reason) = self.connections.can_accept_inbound(ip) {
            self.gate.report_refused(ip, reason.clone());
            return Err(TransportError::Refused(reason));
        }
        configure_socket(&stream);

        let stream: BoxedStream = match &self.tls {
            Some(tls) => match timeout(self.config.handshake_timeout(), tls.accept(stream)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.gate.record_abnormal_close(ip, "tls handshake failed");
                    self.gate.report_refused(ip, e.to_string());
                    return Err(e.into());
                }
                Err(_) => {
                    self.gate.record_abnormal_close(ip, "tls handshake timeout");
                    return Err(TransportError::Timeout(format!("TLS handshake from {}", remote)));
                }
            },
            None => Box::new(stream),
        };

        info!("🔗 [Inbound] Accepted connection from {}", remote);
        Ok(self.attach(stream, remote, ConnectionDirection::Inbound))
    }

    /// Dial `address` and start a session on success.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<PeerConnection, TransportError> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            self.refuse_if_banned(addr.ip())?;
        }
        self.connections
            .can_connect_outbound()
            .map_err(TransportError::Refused)?;
        if !self.connections.mark_dialing(address) {
            return Err(TransportError::AlreadyDialing(address.to_string()));
        }

        let result = self.dial(address).await;
        self.connections.finish_dialing(address);
        result
    }

    async fn dial(self: &Arc<Self>, address: &str) -> Result<PeerConnection, TransportError> {
        info!("🔗 [Outbound] Connecting to {}", address);
        let stream = timeout(self.config.io_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", address)))?
            .map_err(|e| TransportError::Connect(address.to_string(), e.to_string()))?;
        let remote = stream.peer_addr()?;
        self.refuse_if_banned(remote.ip())?;
        configure_socket(&stream);

        let stream: BoxedStream = match &self.tls {
            Some(tls) => timeout(self.config.handshake_timeout(), tls.connect(stream))
                .await
                .map_err(|_| TransportError::Timeout(format!("TLS handshake with {}", address)))??,
            None => Box::new(stream),
        };

        Ok(self.attach(stream, remote, ConnectionDirection::Outbound))
    }

    /// Register a connected stream and spawn its reader, writer and session tasks.
    pub fn attach<S>(
        self: &Arc<Self>,
        stream: S,
        remote: SocketAddr,
        direction: ConnectionDirection,
    ) -> PeerConnection
    where
        S: PeerStream + 'static,
    {
        let peer_id = remote.to_string();
        let cancel = self.shutdown.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_QUEUE);

        let info = PeerConnection::new(peer_id.clone(), remote, direction);
        self.registry
            .register_peer(info.clone(), queue_tx, cancel.clone());
        self.connections
            .mark_connected(&peer_id, remote.ip(), direction);

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_loop(reader, frame_tx, cancel.clone()));
        let writer = tokio::spawn(write_loop(
            writer,
            queue_rx,
            cancel.clone(),
            self.config.io_timeout(),
        ));

        let session = PeerSession::new(self.clone(), peer_id, remote, cancel);
        tokio::spawn(session.run(frame_rx, writer));
        info
    }

    /// Seal and queue `payload` for one peer.
    pub async fn send(&self, peer_id: &str, payload: Payload) -> Result<(), TransportError> {
        let body = self.gate.seal_bytes(payload)?;
        self.send_sealed(peer_id, &body).await
    }

    pub(crate) async fn send_sealed(&self, peer_id: &str, body: &[u8]) -> Result<(), TransportError> {
        let queue = self
            .registry
            .outbound_queue(peer_id)
            .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))?;
        let frame = encode_frame(body).map_err(TransportError::Frame)?;
        self.gate.check_outbound(peer_id, frame.len())?;

        let size = frame.len() as u64;
        timeout(self.config.io_timeout(), queue.send(frame))
            .await
            .map_err(|_| TransportError::Timeout(format!("send queue of {}", peer_id)))?
            .map_err(|_| TransportError::Closed(peer_id.to_string()))?;

        self.registry.update(peer_id, |peer| {
            peer.bytes_out += size;
            peer.messages_out += 1;
            peer.last_activity_at = Instant::now();
        });
        Ok(())
    }

    /// Send a request and wait for the matching response type from the same peer.
    pub async fn request(
        &self,
        peer_id: &str,
        payload: Payload,
        wait: Duration,
    ) -> Result<Payload, TransportError> {
        let response_type = payload
            .response_type()
            .ok_or(TransportError::NotARequest(payload.message_type()))?;
        let waiter = self.registry.register_waiter(peer_id, response_type);
        self.send(peer_id, payload).await?;

        match timeout(wait, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed(peer_id.to_string())),
            Err(_) => Err(TransportError::Timeout(format!(
                "{} from {}",
                response_type, peer_id
            ))),
        }
    }

    fn ready_peer_ids(&self, except: Option<&str>) -> Vec<String> {
        self.registry
            .ready_peers()
            .into_iter()
            .map(|peer| peer.peer_id)
            .filter(|peer_id| Some(peer_id.as_str()) != except)
            .collect()
    }

    /// Sign once and queue for every ready peer except `except`.
    pub async fn broadcast(&self, payload: Payload, except: Option<&str>) -> usize {
        let peers = self.ready_peer_ids(except);
        self.send_to_many(payload, peers).await
    }

    /// Like [`broadcast`](Self::broadcast) but to a random subset of `fanout` peers.
    pub async fn gossip(&self, payload: Payload, except: Option<&str>, fanout: usize) -> usize {
        let mut peers = self.ready_peer_ids(except);
        {
            let mut rng = rand::thread_rng();
            peers.shuffle(&mut rng);
        }
        peers.truncate(fanout);
        self.send_to_many(payload, peers).await
    }

    /// Sign once and queue for each of `peers`. Returns how many were queued.
    pub async fn send_to_many(&self, payload: Payload, peers: Vec<String>) -> usize {
        if peers.is_empty() {
            return 0;
        }
        let kind = payload.message_type();
        let body = match self.gate.seal_bytes(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("❌ Failed to seal {} for broadcast: {}", kind, e);
                return 0;
            }
        };

        let mut sent = 0;
        for peer_id in peers {
            match self.send_sealed(&peer_id, &body).await {
                Ok(()) => sent += 1,
                Err(e) => debug!("Skipping {} for {}: {}", kind, peer_id, e),
            }
        }
        sent
    }

    /// Ask every ready peer and keep the responses that arrive within `window`.
    pub async fn broadcast_request(
        &self,
        payload: Payload,
        window: Duration,
    ) -> Vec<(String, Payload)> {
        let requests = self.ready_peer_ids(None).into_iter().map(|peer_id| {
            let payload = payload.clone();
            async move {
                let result = self.request(&peer_id, payload, window).await;
                (peer_id, result)
            }
        });

        join_all(requests)
            .await
            .into_iter()
            .filter_map(|(peer_id, result)| match result {
                Ok(response) => Some((peer_id, response)),
                Err(e) => {
                    debug!("No response from {}: {}", peer_id, e);
                    None
                }
            })
            .collect()
    }

    /// Refresh our advertised height and features on every ready connection.
    pub async fn announce_handshake(&self) -> usize {
        let handshake = self.handshake_payload().await;
        self.broadcast(handshake, None).await
    }

    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.registry.disconnect(peer_id)
    }

    /// Close every connection from `ip`, e.g. after a ban.
    pub fn disconnect_ip(&self, ip: IpAddr) -> usize {
        let mut closed = 0;
        for peer in self.registry.get_connected_peers() {
            if peer.remote_address.ip() == ip && self.registry.disconnect(&peer.peer_id) {
                closed += 1;
            }
        }
        closed
    }

    pub fn is_connected_to(&self, address: &str) -> bool {
        self.registry.is_connected_to(address)
    }
}

fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        debug!("Failed to set TCP_KEEPALIVE: {}", e);
    }
}
