//! Peer Connection Management
//! Per-connection message pump: handshake state machine, liveness and
//! inbound frame processing.
//!
//! Each connection runs three tasks. The reader turns the byte stream into
//! frames, the writer drains the outbound queue, and the session loop below
//! owns all per-connection state so it never shares it across tasks.

use crate::network::connection_manager::ConnectionDirection;
use crate::network::message::{Handshake, Payload};
use crate::network::peer_connection_registry::HandshakeState;
use crate::network::rate_limiter::{BudgetScope, InboundVerdict};
use crate::network::reputation::ReputationEvent;
use crate::network::transport::{InboundMessage, Origin, Transport, TransportEvent};
use crate::network::wire::{read_frame, write_frame};
use crate::types::NodeId;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_MISSED_PONGS: u32 = 3;

type FrameResult = Result<Vec<u8>, String>;

/// State for tracking ping/pong health
#[derive(Debug)]
struct PingState {
    last_ping_sent: Option<Instant>,
    last_pong_received: Option<Instant>,
    pending_pings: Vec<(u64, Instant)>, // (nonce, sent_time)
    missed_pongs: u32,
}

impl PingState {
    fn new() -> Self {
        Self {
            last_ping_sent: None,
            last_pong_received: None,
            pending_pings: Vec::new(),
            missed_pongs: 0,
        }
    }

    fn record_ping_sent(&mut self, nonce: u64) {
        let now = Instant::now();
        self.last_ping_sent = Some(now);
        self.pending_pings.push((nonce, now));

        // Keep only last 5 pings
        if self.pending_pings.len() > 5 {
            self.pending_pings.remove(0);
        }
    }

    /// False for a pong that matches no outstanding ping.
    fn record_pong_received(&mut self, nonce: u64) -> bool {
        match self.pending_pings.iter().position(|(n, _)| *n == nonce) {
            Some(pos) => {
                self.pending_pings.remove(pos);
                self.last_pong_received = Some(Instant::now());
                self.missed_pongs = 0;
                true
            }
            None => false,
        }
    }

    fn check_timeout(&mut self, max_missed: u32, timeout_duration: Duration) -> bool {
        let now = Instant::now();

        let mut expired_count = 0;
        self.pending_pings.retain(|(_, sent_time)| {
            if now.duration_since(*sent_time) > timeout_duration {
                expired_count += 1;
                false
            } else {
                true
            }
        });

        if expired_count > 0 {
            self.missed_pongs += expired_count;
            debug!(
                "⏰ {} ping(s) expired, total missed: {}/{}",
                expired_count, self.missed_pongs, max_missed
            );
        }

        self.missed_pongs >= max_missed
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Eof,
    /// Closed from our side: shutdown, ban or explicit disconnect.
    Cancelled,
    SelfConnection,
    Idle,
    PingTimeout,
    HandshakeTimeout,
    ProtocolViolation(String),
    BandwidthExceeded(BudgetScope),
    Io(String),
}

impl CloseReason {
    /// Closes that count toward reset-storm detection.
    pub fn is_abnormal(&self, handshake_completed: bool) -> bool {
        match self {
            CloseReason::Eof => !handshake_completed,
            CloseReason::HandshakeTimeout
            | CloseReason::ProtocolViolation(_)
            | CloseReason::BandwidthExceeded(_)
            | CloseReason::Io(_) => true,
            CloseReason::Cancelled
            | CloseReason::SelfConnection
            | CloseReason::Idle
            | CloseReason::PingTimeout => false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "closed by peer"),
            CloseReason::Cancelled => write!(f, "closed locally"),
            CloseReason::SelfConnection => write!(f, "self connection"),
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::PingTimeout => write!(f, "missed {} pongs", MAX_MISSED_PONGS),
            CloseReason::HandshakeTimeout => write!(f, "handshake timeout"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
            CloseReason::BandwidthExceeded(scope) => {
                write!(f, "{:?} bandwidth budget exceeded", scope)
            }
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

pub(crate) async fn read_loop<R>(
    mut reader: R,
    frames: mpsc::Sender<FrameResult>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = read_frame(&mut reader) => next,
        };
        match next {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            // Dropping the sender tells the session the peer hung up
            Ok(None) => break,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                break;
            }
        }
    }
}

pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    io_timeout: Duration,
) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break Ok(()),
            },
        };
        match timeout(io_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err("write timed out".to_string()),
        }
    };
    let _ = writer.shutdown().await;
    result
}

pub(crate) struct PeerSession {
    transport: Arc<Transport>,
    peer_id: String,
    remote: SocketAddr,
    cancel: CancellationToken,
    ping: PingState,
    handshake_done: bool,
    /// Signer bound to this connection by its handshake
    sender: Option<NodeId>,
}

impl PeerSession {
    pub(crate) fn new(
        transport: Arc<Transport>,
        peer_id: String,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            peer_id,
            remote,
            cancel,
            ping: PingState::new(),
            handshake_done: false,
            sender: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut frames: mpsc::Receiver<FrameResult>,
        mut writer: JoinHandle<Result<(), String>>,
    ) {
        let reason = self.pump(&mut frames, &mut writer).await;
        self.close(reason).await;
    }

    async fn pump(
        &mut self,
        frames: &mut mpsc::Receiver<FrameResult>,
        writer: &mut JoinHandle<Result<(), String>>,
    ) -> CloseReason {
        let config = self.transport.config.clone();
        let ping_interval = config.ping_interval();
        let idle_timeout = config.idle_timeout();

        let handshake_deadline = sleep(config.handshake_timeout());
        tokio::pin!(handshake_deadline);
        let mut ping_tick = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_check = (idle_timeout / 4).max(Duration::from_secs(1));
        let mut idle_tick = interval_at(Instant::now() + idle_check, idle_check);

        // Handshake goes out immediately on accept and connect
        let handshake = self.transport.handshake_payload().await;
        if let Err(e) = self.transport.send(&self.peer_id, handshake).await {
            return CloseReason::Io(format!("failed to send handshake: {}", e));
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return CloseReason::Cancelled,

                result = &mut *writer => {
                    return CloseReason::Io(match result {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Err(e) => e.to_string(),
                    });
                }

                _ = &mut handshake_deadline, if !self.handshake_done => {
                    return CloseReason::HandshakeTimeout;
                }

                frame = frames.recv() => match frame {
                    None => return CloseReason::Eof,
                    Some(Err(e)) => return CloseReason::Io(e),
                    Some(Ok(frame)) => {
                        if let Some(reason) = self.on_frame(frame).await {
                            return reason;
                        }
                    }
                },

                _ = ping_tick.tick(), if self.handshake_done => {
                    if self.ping.check_timeout(MAX_MISSED_PONGS, config.io_timeout()) {
                        return CloseReason::PingTimeout;
                    }
                    self.send_ping().await;
                }

                _ = idle_tick.tick() => {
                    let idle = self
                        .transport
                        .registry
                        .get(&self.peer_id)
                        .map(|peer| peer.last_activity_at.elapsed() > idle_timeout)
                        .unwrap_or(true);
                    if idle {
                        return CloseReason::Idle;
                    }
                }
            }
        }
    }

    async fn send_ping(&mut self) {
        let nonce: u64 = rand::random();
        self.ping.record_ping_sent(nonce);
        let height = self.transport.local_height().await;
        if let Err(e) = self
            .transport
            .send(&self.peer_id, Payload::Ping { nonce, height })
            .await
        {
            debug!("Failed to send ping to {}: {}", self.peer_id, e);
        }
    }

    /// Returns a close reason when the frame ends the connection.
    async fn on_frame(&mut self, frame: Vec<u8>) -> Option<CloseReason> {
        let size = frame.len() + 4;
        let gate = self.transport.gate.clone();

        match gate.check_inbound(&self.peer_id, size) {
            InboundVerdict::Accept => {}
            InboundVerdict::RateLimited => return None,
            InboundVerdict::BandwidthExceeded(scope) => {
                return Some(CloseReason::BandwidthExceeded(scope))
            }
        }
        self.transport.registry.update(&self.peer_id, |peer| {
            peer.bytes_in += size as u64;
            peer.messages_in += 1;
            peer.last_activity_at = Instant::now();
        });

        let envelope = match gate.verify(&frame) {
            Ok(envelope) => envelope,
            Err(reason) => {
                let close = reason
                    .is_fatal()
                    .then(|| CloseReason::ProtocolViolation(reason.to_string()));
                gate.report_rejection(&self.peer_id, self.remote.ip(), reason);
                return close;
            }
        };

        if !self.handshake_done {
            return match envelope.payload {
                Payload::Handshake(handshake) => {
                    self.on_handshake(envelope.sender_id, handshake).await
                }
                other => Some(self.violation(format!(
                    "expected handshake, got {}",
                    other.message_type()
                ))),
            };
        }

        if self.sender != Some(envelope.sender_id) {
            return Some(self.violation("envelope signer changed mid-connection"));
        }
        self.dispatch(envelope.payload).await
    }

    fn violation(&self, detail: impl Into<String>) -> CloseReason {
        let detail = detail.into();
        self.transport
            .gate
            .report_violation(&self.peer_id, self.remote.ip(), detail.clone());
        CloseReason::ProtocolViolation(detail)
    }

    async fn on_handshake(&mut self, signer: NodeId, handshake: Handshake) -> Option<CloseReason> {
        if handshake.node_id != signer {
            return Some(self.violation("handshake node id does not match signer"));
        }
        if handshake.node_id == self.transport.gate.node_id() {
            return Some(CloseReason::SelfConnection);
        }

        self.handshake_done = true;
        self.sender = Some(signer);
        self.apply_handshake(&handshake);

        info!(
            "🤝 Handshake completed with {} (node {}, height {}, v{})",
            self.peer_id,
            handshake.node_id.short(),
            handshake.height,
            handshake.version
        );
        if let Some(peer) = self.transport.registry.get(&self.peer_id) {
            self.transport.emit(TransportEvent::PeerReady(peer)).await;
        }
        None
    }

    fn apply_handshake(&self, handshake: &Handshake) {
        let listen_address = handshake
            .listen_address
            .as_deref()
            .and_then(|addr| resolve_listen_address(addr, self.remote));
        self.transport.registry.update(&self.peer_id, |peer| {
            peer.handshake_state = HandshakeState::Completed;
            peer.node_id = Some(handshake.node_id);
            peer.advertised_features = handshake.features.clone();
            peer.advertised_height = handshake.height;
            peer.api_endpoint = handshake.api_endpoint.clone();
            peer.listen_address = listen_address;
            peer.udp_port = handshake.udp_port;
        });
    }

    async fn update_height(&self, height: u64) {
        self.transport.registry.update(&self.peer_id, |peer| {
            peer.advertised_height = height;
        });
        self.transport
            .emit(TransportEvent::PeerHeight {
                peer_id: self.peer_id.clone(),
                height,
            })
            .await;
    }

    async fn dispatch(&mut self, payload: Payload) -> Option<CloseReason> {
        match payload {
            Payload::Handshake(handshake) => {
                if Some(handshake.node_id) != self.sender {
                    return Some(self.violation("re-handshake changed node id"));
                }
                self.apply_handshake(&handshake);
                self.update_height(handshake.height).await;
            }
            Payload::Ping { nonce, height } => {
                let local = self.transport.local_height().await;
                if let Err(e) = self
                    .transport
                    .send(&self.peer_id, Payload::Pong { nonce, height: local })
                    .await
                {
                    debug!("Failed to answer ping from {}: {}", self.peer_id, e);
                }
                self.update_height(height).await;
            }
            Payload::Pong { nonce, height } => {
                // Unmatched pongs are ignored
                if self.ping.record_pong_received(nonce) {
                    self.update_height(height).await;
                }
            }
            payload if payload.is_response() => {
                if let Some(unsolicited) =
                    self.transport.registry.handle_response(&self.peer_id, payload)
                {
                    self.forward(unsolicited).await;
                }
            }
            payload => self.forward(payload).await,
        }
        None
    }

    async fn forward(&self, payload: Payload) {
        let Some(sender) = self.sender else {
            return;
        };
        self.transport
            .emit(TransportEvent::Message(InboundMessage {
                peer_id: self.peer_id.clone(),
                remote_address: self.remote,
                sender,
                origin: Origin::Stream,
                payload,
            }))
            .await;
    }

    async fn close(self, reason: CloseReason) {
        self.cancel.cancel();
        let transport = &self.transport;
        let ip = self.remote.ip();

        let direction = transport
            .registry
            .unregister_peer(&self.peer_id)
            .map(|peer| peer.direction);
        transport.connections.mark_disconnected(&self.peer_id);
        transport.gate.forget_peer(&self.peer_id, self.sender.as_ref());

        if reason.is_abnormal(self.handshake_done) {
            transport.gate.record_abnormal_close(ip, &reason.to_string());
        }
        if !matches!(reason, CloseReason::Cancelled | CloseReason::SelfConnection) {
            transport
                .gate
                .record_reputation(ip, ReputationEvent::Disconnect);
        }

        let direction = direction.unwrap_or(ConnectionDirection::Inbound);
        match &reason {
            CloseReason::Eof | CloseReason::Cancelled | CloseReason::SelfConnection => {
                info!("🔌 [{:?}] Connection to {} ended: {}", direction, self.peer_id, reason)
            }
            _ => warn!("🔌 [{:?}] Connection to {} dropped: {}", direction, self.peer_id, reason),
        }

        transport
            .emit(TransportEvent::Disconnected {
                peer_id: self.peer_id.clone(),
                remote_address: self.remote,
                reason,
            })
            .await;
    }
}

/// Peers bound to a wildcard address advertise it; dial them on the address we see instead.
fn resolve_listen_address(advertised: &str, remote: SocketAddr) -> Option<String> {
    let addr: SocketAddr = match advertised.parse() {
        Ok(addr) => addr,
        // Hostnames are kept as advertised
        Err(_) => return Some(advertised.to_string()),
    };
    if addr.ip().is_unspecified() {
        Some(SocketAddr::new(remote.ip(), addr.port()).to_string())
    } else {
        Some(addr.to_string())
    }
}
