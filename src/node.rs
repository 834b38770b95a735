//! Node assembly: builds every component from a [`Config`] and runs the
//! background tasks that tie them together.
//!
//! Tasks, all stopped by the shared shutdown token:
//!
//! | task            | period                         |
//! |-----------------|--------------------------------|
//! | stream listener | -                              |
//! | datagram socket | -                              |
//! | block API       | -                              |
//! | event loop      | -                              |
//! | security events | -                              |
//! | health          | `transport.health_interval`    |
//! | handshake       | `transport.handshake_interval` |
//! | sync            | `sync.interval`                |
//! | reconnect sweep | `reconnect.sweep_interval`     |
//! | trust reload    | `tls.reload_interval`          |

use crate::config::{Config, TlsSettings};
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::network::block_source::PeerBlockSource;
use crate::network::chain_sync::ChainSynchronizer;
use crate::network::datagram::DatagramTransport;
use crate::network::dedup_filter::GossipDeduplicator;
use crate::network::dispatcher::PeerDispatcher;
use crate::network::envelope::NodeIdentity;
use crate::network::gossip::GossipEngine;
use crate::network::http_api::{self, ApiState};
use crate::network::message::{Payload, FEATURE_UDP};
use crate::network::message_handler::MessageHandler;
use crate::network::reconnect::ReconnectSupervisor;
use crate::network::security::{SecurityEvent, SecurityGate};
use crate::network::server::NetworkServer;
use crate::network::sync_coordinator::{SyncCoordinator, SyncTrigger};
use crate::network::tls::{TlsConfig, TlsError, TrustStore};
use crate::network::transport::{Transport, TransportEvent};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handles onto a running node.
#[derive(Clone)]
pub struct NodeHandle {
    pub ledger: Arc<dyn Ledger>,
    pub transport: Arc<Transport>,
    pub gossip: Arc<GossipEngine>,
    pub coordinator: Arc<SyncCoordinator>,
    pub supervisor: Arc<ReconnectSupervisor>,
    pub p2p_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,
    pub shutdown: CancellationToken,
}

pub struct Node {
    config: Config,
    handle: NodeHandle,
    handler: Arc<MessageHandler>,
    server: NetworkServer,
    datagram: Option<Arc<DatagramTransport>>,
    http_listener: Option<TcpListener>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Node {
    /// Bind every listener and wire the components together. Nothing runs
    /// until [`spawn`](Self::spawn).
    pub async fn build(
        mut config: Config,
        identity: Arc<NodeIdentity>,
        ledger: Arc<dyn Ledger>,
        shutdown: CancellationToken,
    ) -> Result<Self, AppError> {
        if config.network.udp_listen_address.is_some()
            && !config.security.features.iter().any(|f| f == FEATURE_UDP)
        {
            config.security.features.push(FEATURE_UDP.to_string());
        }

        let gate = Arc::new(SecurityGate::new(identity, &config.security));
        info!("🔑 Node id {}", gate.node_id());

        let tls = build_tls(&config.tls)?;
        let (transport, events) =
            Transport::new(&config, gate, ledger.clone(), tls, shutdown.clone());

        let server = NetworkServer::new(&config.network.listen_address, transport.clone())
            .await
            .map_err(|e| {
                AppError::Network(format!("bind {}: {}", config.network.listen_address, e))
            })?;
        let p2p_addr = server.local_addr()?;

        let datagram = match &config.network.udp_listen_address {
            Some(addr) => Some(Arc::new(
                DatagramTransport::bind(addr, transport.clone()).await?,
            )),
            None => None,
        };
        let udp_addr = match &datagram {
            Some(datagram) => Some(datagram.local_addr()?),
            None => None,
        };

        let http_listener = match &config.network.http_listen_address {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let http_addr = match &http_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let gossip = Arc::new(GossipEngine::new(
            Arc::new(GossipDeduplicator::new(
                config.gossip.dedup_capacity,
                Duration::from_secs(config.gossip.dedup_ttl_secs),
            )),
            ledger.clone(),
            transport.clone(),
            datagram.clone(),
            Duration::from_secs(config.gossip.request_window_secs),
            config.gossip.fanout,
        ));

        let source = Arc::new(PeerBlockSource::new(
            transport.clone(),
            Duration::from_secs(config.sync.chunk_timeout_secs),
        ));
        let synchronizer = Arc::new(ChainSynchronizer::new(
            ledger.clone(),
            source,
            config.sync.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(synchronizer, &config.sync));

        let supervisor = Arc::new(ReconnectSupervisor::new(
            config.reconnect.base_backoff_secs,
            config.reconnect.max_backoff_secs,
        ));
        for address in config
            .network
            .bootstrap_peers
            .iter()
            .chain(config.network.persistent_peers.iter())
        {
            supervisor.register(address);
        }

        let handler = Arc::new(MessageHandler::new(
            ledger.clone(),
            transport.clone(),
            gossip.clone(),
            coordinator.clone(),
        ));

        Ok(Self {
            config,
            handle: NodeHandle {
                ledger,
                transport,
                gossip,
                coordinator,
                supervisor,
                p2p_addr,
                http_addr,
                udp_addr,
                shutdown,
            },
            handler,
            server,
            datagram,
            http_listener,
            events,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Start every background task.
    pub fn spawn(self) -> (NodeHandle, Vec<JoinHandle<()>>) {
        let Node {
            config,
            handle,
            handler,
            server,
            datagram,
            http_listener,
            events,
        } = self;
        let shutdown = handle.shutdown.clone();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(server.run(shutdown.clone())));
        if let Some(datagram) = datagram {
            tasks.push(tokio::spawn(datagram.run(shutdown.clone())));
        }
        if let Some(listener) = http_listener {
            let state = ApiState {
                ledger: handle.ledger.clone(),
                transport: handle.transport.clone(),
            };
            tasks.push(tokio::spawn(http_api::serve(listener, state, shutdown.clone())));
        }

        tasks.push(tokio::spawn(event_loop(
            events,
            PeerDispatcher::new(handler),
            handle.clone(),
        )));
        tasks.push(tokio::spawn(security_loop(
            handle.transport.gate().subscribe(),
            handle.transport.clone(),
            shutdown.clone(),
        )));

        let transport = handle.transport.clone();
        let gossip = handle.gossip.clone();
        tasks.push(spawn_periodic(
            config.transport.health_interval_secs,
            shutdown.clone(),
            move || {
                let transport = transport.clone();
                let gossip = gossip.clone();
                async move { health_check(&transport, &gossip) }
            },
        ));

        let transport = handle.transport.clone();
        tasks.push(spawn_periodic(
            config.transport.handshake_interval_secs,
            shutdown.clone(),
            move || {
                let transport = transport.clone();
                async move {
                    let sent = transport.announce_handshake().await;
                    debug!("🤝 Re-announced handshake to {} peers", sent);
                }
            },
        ));

        let coordinator = handle.coordinator.clone();
        tasks.push(spawn_periodic(
            config.sync.interval_secs,
            shutdown.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    coordinator.request_sync(SyncTrigger::Periodic).await;
                }
            },
        ));

        handle.supervisor.sweep(&handle.transport);
        let supervisor = handle.supervisor.clone();
        let transport = handle.transport.clone();
        tasks.push(spawn_periodic(
            config.reconnect.sweep_interval_secs,
            shutdown.clone(),
            move || {
                let supervisor = supervisor.clone();
                let transport = transport.clone();
                async move {
                    supervisor.sweep(&transport);
                }
            },
        ));

        if let Some(trust) = handle.transport.trust_store() {
            tasks.push(spawn_periodic(
                config.tls.reload_interval_secs,
                shutdown,
                move || {
                    let trust = trust.clone();
                    async move {
                        match trust.reload() {
                            Ok(count) => debug!("🔒 Trust store reloaded: {} fingerprints", count),
                            Err(e) => warn!("⚠️  Trust store reload failed, keeping previous set: {}", e),
                        }
                    }
                },
            ));
        }

        info!(
            "🚀 Node running: p2p {}, http {}, udp {}",
            handle.p2p_addr,
            handle
                .http_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "off".to_string()),
            handle
                .udp_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "off".to_string()),
        );
        (handle, tasks)
    }
}

fn build_tls(settings: &TlsSettings) -> Result<Option<TlsConfig>, TlsError> {
    if !settings.enabled {
        return Ok(None);
    }
    let trust = Arc::new(TrustStore::new(
        settings.trust_store_paths.iter().map(PathBuf::from).collect(),
    ));
    match trust.reload() {
        Ok(count) => info!("🔒 Loaded {} trusted certificate fingerprints", count),
        Err(e) => warn!("⚠️  Could not read trust store: {}", e),
    }

    let tls = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => TlsConfig::from_pem_files(
            Path::new(cert),
            Path::new(key),
            trust,
            settings.require_client_cert,
        )?,
        _ => TlsConfig::new_self_signed(trust, settings.require_client_cert)?,
    };
    info!("🔒 TLS enabled, certificate fingerprint {}", tls.local_fingerprint());
    Ok(Some(tls))
}

/// Run `tick` every `period_secs`, starting one period from now.
fn spawn_periodic<F, Fut>(period_secs: u64, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if period_secs == 0 {
            return;
        }
        let period = Duration::from_secs(period_secs);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

/// Route transport events: messages to per-peer handler queues, height news
/// to the coordinator. Nothing in here waits on a single peer.
async fn event_loop(
    mut events: mpsc::Receiver<TransportEvent>,
    dispatcher: PeerDispatcher,
    node: NodeHandle,
) {
    loop {
        let event = tokio::select! {
            _ = node.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::Message(message) => {
                dispatcher.submit(message);
            }
            TransportEvent::PeerReady(peer) => {
                info!(
                    "🤝 Peer {} ready at height {} ({})",
                    peer.peer_id, peer.advertised_height, peer.direction
                );
                let transport = node.transport.clone();
                let peer_id = peer.peer_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&peer_id, Payload::GetPeers).await {
                        debug!("get_peers to {} failed: {}", peer_id, e);
                    }
                });
                maybe_sync(&node, peer.advertised_height).await;
            }
            TransportEvent::PeerHeight { height, .. } => maybe_sync(&node, height).await,
            TransportEvent::Disconnected {
                peer_id, reason, ..
            } => {
                dispatcher.forget(&peer_id);
                debug!("Peer {} gone: {}", peer_id, reason);
            }
        }
    }
    debug!("Event loop stopped");
}

async fn maybe_sync(node: &NodeHandle, peer_height: u64) {
    if peer_height <= node.ledger.height().await {
        return;
    }
    let coordinator = node.coordinator.clone();
    tokio::spawn(async move {
        coordinator.request_sync(SyncTrigger::OnDemand).await;
    });
}

/// Close every connection of a freshly banned IP.
async fn security_loop(
    mut events: broadcast::Receiver<SecurityEvent>,
    transport: Arc<Transport>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SecurityEvent::PeerBanned { ip, .. }) => {
                let closed = transport.disconnect_ip(ip);
                if closed > 0 {
                    info!("🚫 Closed {} connections from banned {}", closed, ip);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Security event listener lagged by {}", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn health_check(transport: &Transport, gossip: &GossipEngine) {
    transport.gate().cleanup();
    let pruned = transport.registry().prune_waiters();
    let (bans, storms) = transport.gate().ban_stats();
    let (txs, blocks) = gossip.dedup().sizes();
    let connections = transport.connections();
    debug!(
        peers = transport.registry().peer_count(),
        inbound = connections.inbound_count(),
        outbound = connections.outbound_count(),
        bans,
        storms,
        seen_txs = txs,
        seen_blocks = blocks,
        in_flight = gossip.in_flight_count(),
        pruned_waiters = pruned,
        "🩺 Health check"
    );
}
