//! Per-peer and global traffic budgets.
//!
//! Every inbound frame costs one message unit plus its byte length, charged
//! against the sending peer and against the node-wide budget. Counters live
//! in fixed windows and reset when their window elapses; they are never
//! negative and exceeding them rejects rather than blocks.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Peer,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    Accept,
    /// Over the message-rate budget: drop this frame, keep the connection.
    RateLimited,
    /// Over a bandwidth budget: the connection must be closed.
    BandwidthExceeded(BudgetScope),
}

#[derive(Debug, Clone)]
pub struct BudgetLimits {
    pub max_messages_per_second: u32,
    pub bandwidth_window: Duration,
    pub peer_inbound_bytes: u64,
    pub peer_outbound_bytes: u64,
    pub global_inbound_bytes: u64,
    pub global_outbound_bytes: u64,
}

impl BudgetLimits {
    pub fn from_config(config: &crate::config::SecurityConfig) -> Self {
        Self {
            max_messages_per_second: config.max_messages_per_second,
            bandwidth_window: Duration::from_secs(config.bandwidth_window_secs.max(1)),
            peer_inbound_bytes: config.peer_inbound_bytes_per_window,
            peer_outbound_bytes: config.peer_outbound_bytes_per_window,
            global_inbound_bytes: config.global_inbound_bytes_per_window,
            global_outbound_bytes: config.global_outbound_bytes_per_window,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started: Instant,
    used: u64,
}

impl WindowCounter {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            used: 0,
        }
    }

    /// Add `amount` and report whether the counter is still within `limit`.
    fn charge(&mut self, now: Instant, window: Duration, amount: u64, limit: u64) -> bool {
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.used = 0;
        }
        self.used = self.used.saturating_add(amount);
        self.used <= limit
    }

    /// Like `charge`, but leaves the counter untouched on rejection.
    fn try_charge(&mut self, now: Instant, window: Duration, amount: u64, limit: u64) -> bool {
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.used = 0;
        }
        match self.used.checked_add(amount) {
            Some(total) if total <= limit => {
                self.used = total;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerBudget {
    messages: WindowCounter,
    inbound: WindowCounter,
    outbound: WindowCounter,
    last_seen: Instant,
}

impl PeerBudget {
    fn new(now: Instant) -> Self {
        Self {
            messages: WindowCounter::new(now),
            inbound: WindowCounter::new(now),
            outbound: WindowCounter::new(now),
            last_seen: now,
        }
    }
}

pub struct RateLimiter {
    limits: BudgetLimits,
    peers: HashMap<String, PeerBudget>,
    global_inbound: WindowCounter,
    global_outbound: WindowCounter,
}

const MESSAGE_WINDOW: Duration = Duration::from_secs(1);

impl RateLimiter {
    pub fn new(limits: BudgetLimits) -> Self {
        let now = Instant::now();
        Self {
            limits,
            peers: HashMap::new(),
            global_inbound: WindowCounter::new(now),
            global_outbound: WindowCounter::new(now),
        }
    }

    /// Charge one inbound frame of `bytes` to `peer`.
    pub fn charge_inbound(&mut self, peer: &str, bytes: u64) -> InboundVerdict {
        let now = Instant::now();
        let limits = &self.limits;
        let budget = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerBudget::new(now));
        budget.last_seen = now;

        let peer_ok = budget.inbound.charge(
            now,
            limits.bandwidth_window,
            bytes,
            limits.peer_inbound_bytes,
        );
        let global_ok = self.global_inbound.charge(
            now,
            limits.bandwidth_window,
            bytes,
            limits.global_inbound_bytes,
        );
        if !peer_ok {
            return InboundVerdict::BandwidthExceeded(BudgetScope::Peer);
        }
        if !global_ok {
            return InboundVerdict::BandwidthExceeded(BudgetScope::Global);
        }

        if !budget.messages.charge(
            now,
            MESSAGE_WINDOW,
            1,
            limits.max_messages_per_second as u64,
        ) {
            return InboundVerdict::RateLimited;
        }

        InboundVerdict::Accept
    }

    /// Reserve outbound bandwidth for `bytes` to `peer`. Nothing is charged on failure.
    pub fn charge_outbound(&mut self, peer: &str, bytes: u64) -> Result<(), BudgetScope> {
        let now = Instant::now();
        let limits = &self.limits;
        let budget = self
            .peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerBudget::new(now));
        budget.last_seen = now;

        let mut peer_probe = budget.outbound;
        if !peer_probe.try_charge(
            now,
            limits.bandwidth_window,
            bytes,
            limits.peer_outbound_bytes,
        ) {
            return Err(BudgetScope::Peer);
        }
        if !self.global_outbound.try_charge(
            now,
            limits.bandwidth_window,
            bytes,
            limits.global_outbound_bytes,
        ) {
            return Err(BudgetScope::Global);
        }
        budget.outbound = peer_probe;
        Ok(())
    }

    /// Drop all state for a closed peer.
    pub fn forget(&mut self, peer: &str) {
        self.peers.remove(peer);
    }

    /// Remove budgets for peers silent for ten windows.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let max_age = self.limits.bandwidth_window * 10;
        self.peers
            .retain(|_, budget| now.duration_since(budget.last_seen) < max_age);
    }

    pub fn tracked_peers(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BudgetLimits {
        BudgetLimits {
            max_messages_per_second: 3,
            bandwidth_window: Duration::from_secs(10),
            peer_inbound_bytes: 1_000,
            peer_outbound_bytes: 500,
            global_inbound_bytes: 5_000,
            global_outbound_bytes: 5_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_rate_drops_then_recovers() {
        let mut limiter = RateLimiter::new(limits());

        for _ in 0..3 {
            assert_eq!(limiter.charge_inbound("a", 10), InboundVerdict::Accept);
        }
        assert_eq!(limiter.charge_inbound("a", 10), InboundVerdict::RateLimited);
        assert_eq!(limiter.charge_inbound("a", 10), InboundVerdict::RateLimited);
        // Other peers have their own budget
        assert_eq!(limiter.charge_inbound("b", 10), InboundVerdict::Accept);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.charge_inbound("a", 10), InboundVerdict::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_bandwidth_exceeded_and_reset() {
        let mut limiter = RateLimiter::new(limits());

        assert_eq!(limiter.charge_inbound("a", 900), InboundVerdict::Accept);
        assert_eq!(
            limiter.charge_inbound("a", 200),
            InboundVerdict::BandwidthExceeded(BudgetScope::Peer)
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.charge_inbound("a", 900), InboundVerdict::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_bandwidth_shared_across_peers() {
        let mut limiter = RateLimiter::new(limits());

        for peer in ["a", "b", "c", "d", "e"] {
            assert_eq!(limiter.charge_inbound(peer, 1_000), InboundVerdict::Accept);
            tokio::time::advance(Duration::from_millis(400)).await;
        }
        assert_eq!(
            limiter.charge_inbound("f", 1),
            InboundVerdict::BandwidthExceeded(BudgetScope::Global)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_rejects_without_charging() {
        let mut limiter = RateLimiter::new(limits());

        assert!(limiter.charge_outbound("a", 400).is_ok());
        assert_eq!(limiter.charge_outbound("a", 200), Err(BudgetScope::Peer));
        // The rejected 200 bytes were not counted
        assert!(limiter.charge_outbound("a", 100).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_and_cleanup() {
        let mut limiter = RateLimiter::new(limits());
        limiter.charge_inbound("a", 1);
        limiter.charge_inbound("b", 1);
        limiter.forget("a");
        assert_eq!(limiter.tracked_peers(), 1);

        tokio::time::advance(Duration::from_secs(101)).await;
        limiter.cleanup();
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
