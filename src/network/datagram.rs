//! Optional UDP side channel for small signed messages (`inv`, `ping`,
//! `pong`) to peers that advertised a UDP port.
//!
//! Datagrams go through the same security gate as stream frames. There is
//! no connection to close, so over-budget or rejected datagrams are dropped.
//! Inventory is only accepted from signers that also hold a stream
//! connection, since the follow-up `getdata` travels over the stream.

use crate::network::message::{Payload, FEATURE_UDP};
use crate::network::peer_connection_registry::PeerConnection;
use crate::network::rate_limiter::InboundVerdict;
use crate::network::transport::{InboundMessage, Origin, Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps signed datagrams under a typical path MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

pub struct DatagramTransport {
    socket: UdpSocket,
    transport: Arc<Transport>,
}

impl DatagramTransport {
    pub async fn bind(addr: &str, transport: Arc<Transport>) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, transport })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    pub async fn send(&self, target: SocketAddr, payload: Payload) -> Result<(), TransportError> {
        if !payload.fits_datagram() {
            return Err(TransportError::Frame(format!(
                "{} cannot travel as a datagram",
                payload.message_type()
            )));
        }
        let gate = self.transport.gate();
        let body = gate.seal_bytes(payload)?;
        if body.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Frame(format!(
                "datagram too large: {} bytes (max: {})",
                body.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        gate.check_outbound(&target.to_string(), body.len())?;
        self.socket.send_to(&body, target).await?;
        Ok(())
    }

    /// Try `peer`'s advertised UDP port. False when it has none or the send failed.
    pub async fn try_send_to(&self, peer: &PeerConnection, payload: &Payload) -> bool {
        if !peer.advertised_features.iter().any(|f| f == FEATURE_UDP) {
            return false;
        }
        let Some(target) = peer.udp_address() else {
            return false;
        };
        match self.send(target, payload.clone()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("UDP send to {} failed: {}", target, e);
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if let Ok(addr) = self.socket.local_addr() {
            info!("📡 Listening for datagrams on {}", addr);
        }
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, from)) => self.on_datagram(&buf[..len], from).await,
                Err(e) => debug!("UDP receive error: {}", e),
            }
        }
    }

    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let gate = self.transport.gate();
        if gate.is_banned(from.ip()).is_some() {
            return;
        }
        let source = from.to_string();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            gate.report_violation(&source, from.ip(), "oversized datagram");
            return;
        }
        if gate.check_inbound(&source, bytes.len()) != InboundVerdict::Accept {
            return;
        }

        let envelope = match gate.verify(bytes) {
            Ok(envelope) => envelope,
            Err(reason) => {
                gate.report_rejection(&source, from.ip(), reason);
                return;
            }
        };
        if !envelope.payload.fits_datagram() {
            gate.report_violation(
                &source,
                from.ip(),
                format!("{} is not allowed over UDP", envelope.payload.message_type()),
            );
            return;
        }

        let registry = self.transport.registry();
        let Some(peer_id) = registry.find_by_node_id(&envelope.sender_id) else {
            debug!("Dropping datagram from {}: no stream connection", from);
            return;
        };

        match envelope.payload {
            Payload::Ping { nonce, height } => {
                let local = self.transport.local_height().await;
                if let Err(e) = self.send(from, Payload::Pong { nonce, height: local }).await {
                    warn!("UDP pong to {} failed: {}", from, e);
                }
                registry.update(&peer_id, |peer| peer.advertised_height = height);
            }
            Payload::Pong { height, .. } => {
                registry.update(&peer_id, |peer| peer.advertised_height = height);
            }
            payload => {
                let remote_address = registry
                    .get(&peer_id)
                    .map(|peer| peer.remote_address)
                    .unwrap_or(from);
                self.transport
                    .deliver(InboundMessage {
                        peer_id,
                        remote_address,
                        sender: envelope.sender_id,
                        origin: Origin::Datagram,
                        payload,
                    })
                    .await;
            }
        }
    }
}
