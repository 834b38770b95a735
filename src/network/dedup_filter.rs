//! Bounded, time-expiring "seen" caches.
//!
//! A membership set paired with a queue ordered by insertion time. Every
//! entry shares the same TTL, so the queue front is always the next entry
//! to expire and purging is oldest-first.

use crate::types::{Hash256, InventoryKind};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

pub struct DedupCache<K> {
    capacity: usize,
    ttl: Duration,
    seen: HashSet<K>,
    order: VecDeque<(Instant, K)>,
}

impl<K: Hash + Eq + Clone> DedupCache<K> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((inserted, _)) = self.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }

    /// Returns true if `key` was seen within the TTL; otherwise records it.
    pub fn is_duplicate(&mut self, key: K) -> bool {
        let now = Instant::now();
        self.purge_expired(now);
        if self.seen.contains(&key) {
            return true;
        }
        self.insert_at(key, now);
        false
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.purge_expired(Instant::now());
        self.seen.contains(key)
    }

    pub fn insert(&mut self, key: K) {
        let now = Instant::now();
        self.purge_expired(now);
        if !self.seen.contains(&key) {
            self.insert_at(key, now);
        }
    }

    fn insert_at(&mut self, key: K, now: Instant) {
        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((_, old)) => {
                    self.seen.remove(&old);
                }
                None => break,
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back((now, key));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Seen-caches for gossiped transactions and blocks.
///
/// Not peer-scoped: entries outlive the connection that delivered them.
pub struct GossipDeduplicator {
    transactions: Mutex<DedupCache<Hash256>>,
    blocks: Mutex<DedupCache<Hash256>>,
}

impl GossipDeduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            transactions: Mutex::new(DedupCache::new(capacity, ttl)),
            blocks: Mutex::new(DedupCache::new(capacity, ttl)),
        }
    }

    fn cache(&self, kind: InventoryKind) -> &Mutex<DedupCache<Hash256>> {
        match kind {
            InventoryKind::Transaction => &self.transactions,
            InventoryKind::Block => &self.blocks,
        }
    }

    pub fn is_duplicate(&self, kind: InventoryKind, id: Hash256) -> bool {
        self.cache(kind).lock().is_duplicate(id)
    }

    pub fn has_seen(&self, kind: InventoryKind, id: &Hash256) -> bool {
        self.cache(kind).lock().contains(id)
    }

    /// Record locally-originated items so echoes are ignored.
    pub fn mark_seen(&self, kind: InventoryKind, id: Hash256) {
        self.cache(kind).lock().insert(id);
    }

    pub fn sizes(&self) -> (usize, usize) {
        (self.transactions.lock().len(), self.blocks.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_until_ttl() {
        let mut cache = DedupCache::new(100, Duration::from_secs(60));

        assert!(!cache.is_duplicate(1u64));
        assert!(cache.is_duplicate(1u64));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.is_duplicate(1u64));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.is_duplicate(1u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_first() {
        let mut cache = DedupCache::new(3, Duration::from_secs(60));
        for key in 0..3u64 {
            assert!(!cache.is_duplicate(key));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(!cache.is_duplicate(3u64));
        assert_eq!(cache.len(), 3);

        // 0 was the oldest and is gone; 1..=3 remain
        assert!(!cache.contains(&0));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_runs_on_every_check() {
        let mut cache = DedupCache::new(100, Duration::from_secs(5));
        for key in 0..10u64 {
            cache.insert(key);
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!cache.is_duplicate(99u64));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_are_independent() {
        let dedup = GossipDeduplicator::new(10, Duration::from_secs(30));
        let id = Hash256([3u8; 32]);

        assert!(!dedup.is_duplicate(InventoryKind::Transaction, id));
        assert!(!dedup.is_duplicate(InventoryKind::Block, id));
        assert!(dedup.is_duplicate(InventoryKind::Transaction, id));
        assert!(dedup.has_seen(InventoryKind::Block, &id));
        assert_eq!(dedup.sizes(), (1, 1));
    }
}
