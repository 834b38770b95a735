#![allow(dead_code)]

use chainmesh::config::Config;
use chainmesh::ledger::{Ledger, MemoryLedger};
use chainmesh::network::envelope::{NodeIdentity, SignedEnvelope};
use chainmesh::network::message::{Handshake, Payload};
use chainmesh::network::wire::{encode_frame, read_frame, write_frame};
use chainmesh::node::{Node, NodeHandle};
use chainmesh::types::{build_chain, unix_now, Block};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Loopback-only config with background timers pushed out of the way.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.network.listen_address = "127.0.0.1:0".to_string();
    config.network.http_listen_address = None;
    config.network.udp_listen_address = None;
    config.sync.interval_secs = 3600;
    config.reconnect.sweep_interval_secs = 3600;
    config.transport.handshake_interval_secs = 3600;
    config
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub ledger: Arc<MemoryLedger>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestNode {
    pub async fn start(config: Config, chain: Vec<Block>) -> Self {
        let ledger = Arc::new(MemoryLedger::with_chain(chain));
        let node = Node::build(
            config,
            Arc::new(NodeIdentity::generate()),
            ledger.clone(),
            CancellationToken::new(),
        )
        .await
        .expect("node builds");
        let (handle, tasks) = node.spawn();
        Self {
            handle,
            ledger,
            tasks,
        }
    }

    pub async fn with_height(height: u64) -> Self {
        Self::start(test_config(), build_chain(height)).await
    }

    pub fn p2p_addr(&self) -> String {
        self.handle.p2p_addr.to_string()
    }

    pub async fn height(&self) -> u64 {
        self.ledger.height().await
    }

    pub fn ready_peers(&self) -> usize {
        self.handle.transport.registry().ready_peers().len()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.handle.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// A hand-driven peer speaking the wire protocol over raw TCP.
pub struct RawPeer {
    pub stream: TcpStream,
    pub identity: NodeIdentity,
}

impl RawPeer {
    pub async fn connect(addr: &str) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.expect("connects"),
            identity: NodeIdentity::generate(),
        }
    }

    pub async fn send(&mut self, payload: Payload) -> Result<(), String> {
        let envelope = self
            .identity
            .seal(payload, 2, vec![], unix_now())
            .map_err(|e| e.to_string())?;
        let frame = encode_frame(&envelope.encode().map_err(|e| e.to_string())?)?;
        write_frame(&mut self.stream, &frame).await
    }

    pub async fn handshake(&mut self, height: u64) -> Result<(), String> {
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
        .await
    }

    /// Next envelope, `None` once the node has closed the connection.
    pub async fn recv(&mut self, limit: Duration) -> Option<SignedEnvelope> {
        match tokio::time::timeout(limit, read_frame(&mut self.stream)).await {
            Ok(Ok(Some(frame))) => SignedEnvelope::decode(&frame).ok(),
            Ok(_) => None,
            Err(_) => panic!("no frame and no close within {:?}", limit),
        }
    }

    /// Wait until the node closes the connection, skipping anything it still sends.
    pub async fn expect_closed(&mut self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if self.recv(left).await.is_none() {
                return;
            }
        }
    }
}
