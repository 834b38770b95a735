//! Inventory gossip: announce ids, request only what is unknown, serve
//! `getdata` from the ledger.

use crate::ledger::Ledger;
use crate::network::datagram::DatagramTransport;
use crate::network::dedup_filter::GossipDeduplicator;
use crate::network::message::{Inventory, Payload};
use crate::network::transport::Transport;
use crate::types::{Hash256, InventoryKind};
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const IN_FLIGHT_CAPACITY: usize = 10_000;

pub struct GossipEngine {
    dedup: Arc<GossipDeduplicator>,
    ledger: Arc<dyn Ledger>,
    transport: Arc<Transport>,
    datagram: Option<Arc<DatagramTransport>>,
    /// Items requested via `getdata` and when
    in_flight: Mutex<LruCache<(InventoryKind, Hash256), Instant>>,
    request_window: Duration,
    fanout: usize,
}

impl GossipEngine {
    pub fn new(
        dedup: Arc<GossipDeduplicator>,
        ledger: Arc<dyn Ledger>,
        transport: Arc<Transport>,
        datagram: Option<Arc<DatagramTransport>>,
        request_window: Duration,
        fanout: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(IN_FLIGHT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            dedup,
            ledger,
            transport,
            datagram,
            in_flight: Mutex::new(LruCache::new(capacity)),
            request_window,
            fanout: fanout.max(1),
        }
    }

    pub fn dedup(&self) -> &Arc<GossipDeduplicator> {
        &self.dedup
    }

    /// Announce `ids` to up to `fanout` ready peers. Returns how many peers were reached.
    pub async fn announce(
        &self,
        kind: InventoryKind,
        ids: Vec<Hash256>,
        except: Option<&str>,
    ) -> usize {
        if ids.is_empty() {
            return 0;
        }
        // Our own announcements echo back; make sure they are filtered
        for id in &ids {
            self.dedup.mark_seen(kind, *id);
        }
        let payload = Payload::Inv(inventory_of(kind, ids));

        let mut targets: Vec<_> = self
            .transport
            .registry()
            .ready_peers()
            .into_iter()
            .filter(|peer| Some(peer.peer_id.as_str()) != except)
            .collect();
        {
            let mut rng = rand::thread_rng();
            targets.shuffle(&mut rng);
        }
        targets.truncate(self.fanout);

        let mut reached = 0;
        let mut stream_targets = Vec::new();
        for peer in targets {
            let via_udp = match &self.datagram {
                Some(datagram) => datagram.try_send_to(&peer, &payload).await,
                None => false,
            };
            if via_udp {
                reached += 1;
            } else {
                stream_targets.push(peer.peer_id);
            }
        }
        reached + self.transport.send_to_many(payload, stream_targets).await
    }

    fn requested_recently(&self, kind: InventoryKind, id: Hash256) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(&(kind, id)) {
            Some(at) if at.elapsed() < self.request_window => true,
            Some(_) => {
                in_flight.pop(&(kind, id));
                false
            }
            None => false,
        }
    }

    async fn is_unknown(&self, kind: InventoryKind, id: Hash256) -> bool {
        if self.dedup.has_seen(kind, &id) || self.requested_recently(kind, id) {
            return false;
        }
        match kind {
            InventoryKind::Transaction => !self.ledger.has_transaction(&id).await,
            InventoryKind::Block => !self.ledger.has_block(&id).await,
        }
    }

    /// Request the locally unknown subset of an announcement from `peer_id`.
    /// Returns how many ids were requested.
    pub async fn on_inventory(&self, peer_id: &str, inventory: Inventory) -> usize {
        let mut wanted = Inventory::default();
        for id in inventory.transactions {
            if self.is_unknown(InventoryKind::Transaction, id).await {
                wanted.transactions.push(id);
            }
        }
        for id in inventory.blocks {
            if self.is_unknown(InventoryKind::Block, id).await {
                wanted.blocks.push(id);
            }
        }
        if wanted.is_empty() {
            return 0;
        }

        let requested = wanted.len();
        {
            let now = Instant::now();
            let mut in_flight = self.in_flight.lock();
            for id in &wanted.transactions {
                in_flight.put((InventoryKind::Transaction, *id), now);
            }
            for id in &wanted.blocks {
                in_flight.put((InventoryKind::Block, *id), now);
            }
        }

        if let Err(e) = self.transport.send(peer_id, Payload::GetData(wanted)).await {
            debug!("getdata to {} failed: {}", peer_id, e);
            return 0;
        }
        requested
    }

    /// Clear the in-flight marker once an item arrives.
    pub fn received(&self, kind: InventoryKind, id: &Hash256) {
        self.in_flight.lock().pop(&(kind, *id));
    }

    /// Answer a `getdata` with the items we hold. Returns how many were sent.
    pub async fn on_getdata(&self, peer_id: &str, request: Inventory) -> usize {
        let mut served = 0;
        for id in &request.transactions {
            if let Some(tx) = self.ledger.transaction(id).await {
                if self
                    .transport
                    .send(peer_id, Payload::Transaction(tx))
                    .await
                    .is_ok()
                {
                    served += 1;
                }
            }
        }
        for id in &request.blocks {
            if let Some(block) = self.ledger.block(id).await {
                if self.transport.send(peer_id, Payload::Block(block)).await.is_ok() {
                    served += 1;
                }
            }
        }
        served
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

fn inventory_of(kind: InventoryKind, ids: Vec<Hash256>) -> Inventory {
    match kind {
        InventoryKind::Transaction => Inventory {
            transactions: ids,
            blocks: vec![],
        },
        InventoryKind::Block => Inventory {
            transactions: vec![],
            blocks: ids,
        },
    }
}
