//! Unified message handler for stream, datagram and HTTP traffic
//!
//! Every verified payload that the per-connection session does not consume
//! itself (handshake, ping/pong, matched responses) ends up here. Items go
//! to the ledger, announcements to the gossip engine, requests are answered
//! from local state, and anything that shows the peer ahead of us triggers
//! an on-demand sync.

use crate::ledger::{Ledger, LedgerError};
use crate::network::gossip::GossipEngine;
use crate::network::message::{Payload, MAX_RANGE_BLOCKS};
use crate::network::reputation::ReputationEvent;
use crate::network::sync_coordinator::{SyncCoordinator, SyncTrigger};
use crate::network::transport::{InboundMessage, Origin, Transport};
use crate::types::{Block, InventoryKind, Transaction};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Most addresses dialled from one `peers` answer.
const MAX_DISCOVERY_DIALS: usize = 8;

pub struct MessageHandler {
    ledger: Arc<dyn Ledger>,
    transport: Arc<Transport>,
    gossip: Arc<GossipEngine>,
    coordinator: Arc<SyncCoordinator>,
}

impl MessageHandler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        transport: Arc<Transport>,
        gossip: Arc<GossipEngine>,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        Self {
            ledger,
            transport,
            gossip,
            coordinator,
        }
    }

    /// Handle a message and send back any response on the same connection.
    pub async fn dispatch(&self, message: InboundMessage) {
        let peer_id = message.peer_id.clone();
        let origin = message.origin;
        let kind = message.payload.message_type();
        match self.handle_message(message).await {
            Ok(Some(response)) if origin != Origin::Http => {
                if let Err(e) = self.transport.send(&peer_id, response).await {
                    debug!("Failed to answer {} from {}: {}", kind, peer_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Rejected {} from {}: {}", kind, peer_id, e),
        }
    }

    /// Handle a network message and optionally return a response message
    ///
    /// * `Ok(Some(response))` - handled, send this response
    /// * `Ok(None)` - handled, no response needed
    /// * `Err(msg)` - the payload was rejected
    pub async fn handle_message(&self, message: InboundMessage) -> Result<Option<Payload>, String> {
        let InboundMessage {
            peer_id,
            remote_address,
            origin,
            payload,
            ..
        } = message;

        if origin == Origin::Http
            && !matches!(payload, Payload::Transaction(_) | Payload::Block(_))
        {
            return Err(format!("{} is not accepted over HTTP", payload.message_type()));
        }

        match payload {
            Payload::Transaction(tx) => {
                self.handle_transaction(&peer_id, remote_address.ip(), tx)
                    .await?;
                Ok(None)
            }
            Payload::Block(block) => {
                self.handle_block(&peer_id, remote_address.ip(), block)
                    .await?;
                Ok(None)
            }

            Payload::GetChain => {
                let height = self.ledger.height().await;
                Ok(Some(Payload::Chain {
                    blocks: self.ledger.blocks(0, height).await,
                }))
            }
            Payload::GetChainRange {
                offset,
                limit,
                include_pending,
            } => {
                let limit = limit.min(MAX_RANGE_BLOCKS);
                let pending = if include_pending {
                    self.ledger.pending_transactions().await
                } else {
                    Vec::new()
                };
                Ok(Some(Payload::ChainRange {
                    offset,
                    total: self.ledger.height().await,
                    blocks: self.ledger.blocks(offset, limit).await,
                    pending,
                }))
            }
            Payload::GetPeers => Ok(Some(Payload::Peers {
                addresses: self.known_addresses(&peer_id),
            })),
            Payload::GetCheckpoint => Ok(Some(Payload::Checkpoint(self.ledger.checkpoint().await))),
            Payload::CheckpointRequest { height } => Ok(Some(Payload::CheckpointPayload(
                self.ledger.checkpoint_payload(height).await,
            ))),

            Payload::Inv(inventory) => {
                let requested = self.gossip.on_inventory(&peer_id, inventory).await;
                if requested > 0 {
                    debug!("📥 Requested {} items from {}", requested, peer_id);
                }
                Ok(None)
            }
            Payload::GetData(request) => {
                self.gossip.on_getdata(&peer_id, request).await;
                Ok(None)
            }

            Payload::Peers { addresses } => {
                self.discover(addresses);
                Ok(None)
            }

            other if other.is_response() => {
                debug!("Unsolicited {} from {}", other.message_type(), peer_id);
                Ok(None)
            }
            other => {
                debug!("Ignoring {} from {}", other.message_type(), peer_id);
                Ok(None)
            }
        }
    }

    async fn handle_transaction(
        &self,
        peer_id: &str,
        ip: std::net::IpAddr,
        tx: Transaction,
    ) -> Result<(), String> {
        let id = tx.id;
        // A forged item must not claim its id in the dedup cache
        if !tx.id_is_valid() {
            self.transport
                .gate()
                .record_reputation(ip, ReputationEvent::InvalidTransaction);
            return Err(format!("transaction {} has an invalid id", id.short()));
        }
        if self
            .gossip
            .dedup()
            .is_duplicate(InventoryKind::Transaction, id)
        {
            return Ok(());
        }
        self.gossip.received(InventoryKind::Transaction, &id);

        match self.ledger.admit_transaction(tx).await {
            Ok(()) => {
                self.transport
                    .gate()
                    .record_reputation(ip, ReputationEvent::ValidTransaction);
                debug!("📥 Transaction {} from {}", id.short(), peer_id);
                self.gossip
                    .announce(InventoryKind::Transaction, vec![id], Some(peer_id))
                    .await;
                Ok(())
            }
            Err(LedgerError::DuplicateTransaction(_)) => Ok(()),
            Err(e) => {
                self.transport
                    .gate()
                    .record_reputation(ip, ReputationEvent::InvalidTransaction);
                Err(e.to_string())
            }
        }
    }

    async fn handle_block(
        &self,
        peer_id: &str,
        ip: std::net::IpAddr,
        block: Block,
    ) -> Result<(), String> {
        let hash = block.hash;
        if !block.hash_is_valid() {
            self.transport
                .gate()
                .record_reputation(ip, ReputationEvent::InvalidBlock);
            return Err(format!("block {} has an invalid hash", block.height));
        }

        if self.gossip.dedup().is_duplicate(InventoryKind::Block, hash) {
            return Ok(());
        }
        self.gossip.received(InventoryKind::Block, &hash);

        let local = self.ledger.height().await;
        if block.height > local {
            info!(
                "📦 Block {} from {} is ahead of local height {}, syncing",
                block.height, peer_id, local
            );
            self.trigger_sync();
            return Ok(());
        }
        if block.height < local {
            debug!(
                "Ignoring block {} from {}: already at height {}",
                block.height, peer_id, local
            );
            return Ok(());
        }

        match self.ledger.append_block(block).await {
            Ok(()) => {
                self.transport
                    .gate()
                    .record_reputation(ip, ReputationEvent::ValidBlock);
                info!("📦 Block {} ({}) from {}", local, hash.short(), peer_id);
                self.gossip
                    .announce(InventoryKind::Block, vec![hash], Some(peer_id))
                    .await;
                Ok(())
            }
            Err(LedgerError::BrokenLink(height)) => {
                // Competing tip; sync decides which chain wins
                warn!("🔀 Block {} from {} does not extend our tip", height, peer_id);
                self.trigger_sync();
                Ok(())
            }
            Err(e) => {
                self.transport
                    .gate()
                    .record_reputation(ip, ReputationEvent::InvalidBlock);
                Err(e.to_string())
            }
        }
    }

    fn trigger_sync(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            coordinator.request_sync(SyncTrigger::OnDemand).await;
        });
    }

    /// Dialable addresses of ready peers other than the asker.
    fn known_addresses(&self, asker: &str) -> Vec<String> {
        self.transport
            .registry()
            .ready_peers()
            .into_iter()
            .filter(|peer| peer.peer_id != asker)
            .filter_map(|peer| peer.listen_address)
            .collect()
    }

    /// Opportunistically dial addresses we are not connected to.
    fn discover(&self, addresses: Vec<String>) {
        let own = self.transport.advertised_address();
        let candidates: Vec<String> = addresses
            .into_iter()
            .filter(|address| Some(address.as_str()) != own.as_deref())
            .filter(|address| !self.transport.is_connected_to(address))
            .filter(|address| !self.transport.connections().is_dialing(address))
            .take(MAX_DISCOVERY_DIALS)
            .collect();

        for address in candidates {
            if self.transport.connections().can_connect_outbound().is_err() {
                break;
            }
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.connect(&address).await {
                    debug!("Discovery dial to {} failed: {}", address, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::MemoryLedger;
    use crate::network::dedup_filter::GossipDeduplicator;
    use crate::network::block_source::PeerBlockSource;
    use crate::network::chain_sync::ChainSynchronizer;
    use crate::network::testing::test_transport;
    use crate::types::{build_chain, Hash256, NodeId};
    use std::time::Duration;

    fn handler(ledger: Arc<MemoryLedger>) -> (MessageHandler, Arc<Transport>) {
        let config = Config::default();
        let (transport, _events) = test_transport(&config, ledger.clone());
        let gossip = Arc::new(GossipEngine::new(
            Arc::new(GossipDeduplicator::new(1000, Duration::from_secs(600))),
            ledger.clone(),
            transport.clone(),
            None,
            Duration::from_secs(30),
            8,
        ));
        let source = Arc::new(PeerBlockSource::new(transport.clone(), Duration::from_secs(1)));
        let synchronizer = Arc::new(ChainSynchronizer::new(
            ledger.clone(),
            source,
            config.sync.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(synchronizer, &config.sync));
        (
            MessageHandler::new(ledger, transport.clone(), gossip, coordinator),
            transport,
        )
    }

    fn inbound(payload: Payload) -> InboundMessage {
        InboundMessage {
            peer_id: "10.1.1.1:9333".to_string(),
            remote_address: "10.1.1.1:9333".parse().unwrap(),
            sender: NodeId([1u8; 32]),
            origin: Origin::Stream,
            payload,
        }
    }

    #[tokio::test]
    async fn test_chain_range_is_served_and_capped() {
        let ledger = Arc::new(MemoryLedger::with_chain(build_chain(12)));
        let (handler, _transport) = handler(ledger);

        let response = handler
            .handle_message(inbound(Payload::GetChainRange {
                offset: 5,
                limit: 4,
                include_pending: false,
            }))
            .await
            .unwrap();
        match response {
            Some(Payload::ChainRange {
                offset,
                total,
                blocks,
                pending,
            }) => {
                assert_eq!(offset, 5);
                assert_eq!(total, 12);
                assert_eq!(
                    blocks.iter().map(|b| b.height).collect::<Vec<_>>(),
                    vec![5, 6, 7, 8]
                );
                assert!(pending.is_empty());
            }
            other => panic!("unexpected response {:?}", other),
        }

        let Some(Payload::ChainRange { blocks, .. }) = handler
            .handle_message(inbound(Payload::GetChainRange {
                offset: 0,
                limit: 10_000,
                include_pending: false,
            }))
            .await
            .unwrap()
        else {
            panic!("expected chain_range");
        };
        assert_eq!(blocks.len(), 12);
    }

    #[tokio::test]
    async fn test_transaction_admitted_once_and_invalid_penalized() {
        let ledger = Arc::new(MemoryLedger::with_chain(build_chain(1)));
        let (handler, transport) = handler(ledger.clone());
        let ip = "10.1.1.1".parse().unwrap();

        let tx = Transaction::new(b"pay alice".to_vec());
        assert_eq!(
            handler
                .handle_message(inbound(Payload::Transaction(tx.clone())))
                .await,
            Ok(None)
        );
        assert!(ledger.has_transaction(&tx.id).await);
        assert_eq!(transport.gate().reputation(&ip), 1);

        // Duplicate is filtered before the ledger sees it
        assert_eq!(
            handler
                .handle_message(inbound(Payload::Transaction(tx)))
                .await,
            Ok(None)
        );
        assert_eq!(transport.gate().reputation(&ip), 1);

        let forged = Transaction {
            id: Hash256([3u8; 32]),
            payload: b"pay mallory".to_vec(),
        };
        assert!(handler
            .handle_message(inbound(Payload::Transaction(forged)))
            .await
            .is_err());
        assert_eq!(transport.gate().reputation(&ip), -4);
    }

    #[tokio::test]
    async fn test_block_at_tip_is_appended() {
        let chain = build_chain(6);
        let ledger = Arc::new(MemoryLedger::with_chain(chain[..5].to_vec()));
        let (handler, _transport) = handler(ledger.clone());

        // Behind the tip: ignored
        assert_eq!(
            handler
                .handle_message(inbound(Payload::Block(chain[2].clone())))
                .await,
            Ok(None)
        );
        assert_eq!(ledger.height().await, 5);

        assert_eq!(
            handler
                .handle_message(inbound(Payload::Block(chain[5].clone())))
                .await,
            Ok(None)
        );
        assert_eq!(ledger.height().await, 6);
    }

    #[tokio::test]
    async fn test_forged_block_does_not_shadow_the_real_one() {
        let chain = build_chain(6);
        let ledger = Arc::new(MemoryLedger::with_chain(chain[..5].to_vec()));
        let (handler, transport) = handler(ledger.clone());
        let ip = "10.1.1.1".parse().unwrap();

        let mut forged = chain[5].clone();
        forged.payload = b"rewritten".to_vec();
        assert!(handler
            .handle_message(inbound(Payload::Block(forged)))
            .await
            .is_err());
        assert_eq!(transport.gate().reputation(&ip), -10);
        assert!(!handler
            .gossip
            .dedup()
            .has_seen(InventoryKind::Block, &chain[5].hash));

        assert_eq!(
            handler
                .handle_message(inbound(Payload::Block(chain[5].clone())))
                .await,
            Ok(None)
        );
        assert_eq!(ledger.height().await, 6);
    }

    #[tokio::test]
    async fn test_forged_transaction_does_not_shadow_the_real_one() {
        let ledger = Arc::new(MemoryLedger::with_chain(build_chain(1)));
        let (handler, transport) = handler(ledger.clone());
        let ip = "10.1.1.1".parse().unwrap();

        let genuine = Transaction::new(b"pay bob".to_vec());
        let forged = Transaction {
            id: genuine.id,
            payload: b"pay mallory".to_vec(),
        };
        assert!(handler
            .handle_message(inbound(Payload::Transaction(forged)))
            .await
            .is_err());
        assert_eq!(transport.gate().reputation(&ip), -5);
        assert!(!ledger.has_transaction(&genuine.id).await);

        assert_eq!(
            handler
                .handle_message(inbound(Payload::Transaction(genuine.clone())))
                .await,
            Ok(None)
        );
        assert!(ledger.has_transaction(&genuine.id).await);
        assert_eq!(
            ledger.transaction(&genuine.id).await.map(|tx| tx.payload),
            Some(b"pay bob".to_vec())
        );
    }

    #[tokio::test]
    async fn test_http_origin_only_carries_items() {
        let ledger = Arc::new(MemoryLedger::with_chain(build_chain(2)));
        let (handler, _transport) = handler(ledger);

        let mut message = inbound(Payload::GetChain);
        message.origin = Origin::Http;
        assert!(handler.handle_message(message).await.is_err());
    }
}
