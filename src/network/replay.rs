//! Per-sender nonce window.

use crate::network::dedup_filter::DedupCache;
use crate::types::NodeId;
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on remembered nonces per sender.
const MAX_NONCES_PER_SENDER: usize = 250_000;

pub struct ReplayWindow {
    ttl: Duration,
    senders: HashMap<NodeId, DedupCache<u64>>,
}

impl ReplayWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            senders: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True if `nonce` from `sender` was accepted within the window.
    pub fn is_replay(&mut self, sender: &NodeId, nonce: u64) -> bool {
        self.senders
            .get_mut(sender)
            .map(|cache| cache.contains(&nonce))
            .unwrap_or(false)
    }

    pub fn record(&mut self, sender: NodeId, nonce: u64) {
        let ttl = self.ttl;
        self.senders
            .entry(sender)
            .or_insert_with(|| DedupCache::new(MAX_NONCES_PER_SENDER, ttl))
            .insert(nonce);
    }

    pub fn forget(&mut self, sender: &NodeId) {
        self.senders.remove(sender);
    }

    /// Drop senders whose every nonce has expired.
    pub fn cleanup(&mut self) {
        self.senders.retain(|_, cache| {
            // contains() purges expired entries as a side effect
            let _ = cache.contains(&0);
            !cache.is_empty()
        });
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }
}
