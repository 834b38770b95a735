//! Helpers for driving a transport over in-memory streams in unit tests.

use crate::config::Config;
use crate::ledger::Ledger;
use crate::network::connection_manager::ConnectionDirection;
use crate::network::envelope::{NodeIdentity, SignedEnvelope};
use crate::network::message::{Handshake, Payload};
use crate::network::security::SecurityGate;
use crate::network::transport::{Transport, TransportEvent};
use crate::network::wire::{encode_frame, read_frame, write_frame};
use crate::types::unix_now;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) fn test_transport(
    config: &Config,
    ledger: Arc<dyn Ledger>,
) -> (Arc<Transport>, mpsc::Receiver<TransportEvent>) {
    let gate = Arc::new(SecurityGate::new(
        Arc::new(NodeIdentity::generate()),
        &config.security,
    ));
    Transport::new(config, gate, ledger, None, CancellationToken::new())
}

/// The far end of an attached connection, speaking as `identity`.
pub(crate) struct RemotePeer {
    pub stream: DuplexStream,
    pub identity: NodeIdentity,
}

impl RemotePeer {
    pub async fn send(&mut self, payload: Payload) {
        let envelope = self
            .identity
            .seal(payload, 2, vec![], unix_now())
            .unwrap();
        let frame = encode_frame(&envelope.encode().unwrap()).unwrap();
        write_frame(&mut self.stream, &frame).await.unwrap();
    }

    pub async fn recv(&mut self) -> Option<SignedEnvelope> {
        let frame = read_frame(&mut self.stream).await.unwrap()?;
        Some(SignedEnvelope::decode(&frame).unwrap())
    }

    pub async fn handshake(&mut self, height: u64) {
        let node_id = self.identity.node_id();
        self.send(Payload::Handshake(Handshake {
            version: 2,
            features: vec![],
            node_id,
            height,
            api_endpoint: None,
            listen_address: None,
            udp_port: None,
        }))
        .await;
    }
}

/// Attach an in-memory connection from `addr`. The transport's handshake is already consumed.
pub(crate) async fn attach_remote(transport: &Arc<Transport>, addr: &str) -> RemotePeer {
    let (local, remote) = tokio::io::duplex(1 << 20);
    transport.attach(local, addr.parse().unwrap(), ConnectionDirection::Inbound);
    let mut peer = RemotePeer {
        stream: remote,
        identity: NodeIdentity::generate(),
    };
    let first = peer.recv().await.unwrap();
    assert!(first.payload.is_handshake());
    peer
}
