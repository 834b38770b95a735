//! Reconnection supervisor for persistent peers.
//!
//! A periodic sweep, independent of any single connection, redials
//! persistent peers that are not connected. The first failure waits the
//! base backoff; each further consecutive failure doubles it up to the cap.
//! A successful connect resets the peer's counters.

use crate::network::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentPeerState {
    pub address: String,
    pub attempt_count: u32,
    pub next_attempt_at: Instant,
    pub backoff_secs: u64,
    /// A dial is in flight
    pub connecting: bool,
}

pub struct ReconnectSupervisor {
    peers: Mutex<HashMap<String, PersistentPeerState>>,
    base_backoff_secs: u64,
    max_backoff_secs: u64,
}

impl ReconnectSupervisor {
    pub fn new(base_backoff_secs: u64, max_backoff_secs: u64) -> Self {
        let base_backoff_secs = base_backoff_secs.max(1);
        Self {
            peers: Mutex::new(HashMap::new()),
            base_backoff_secs,
            max_backoff_secs: max_backoff_secs.max(base_backoff_secs),
        }
    }

    /// Mark `address` persistent. Re-registering keeps existing state.
    pub fn register(&self, address: &str) {
        self.peers
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| PersistentPeerState {
                address: address.to_string(),
                attempt_count: 0,
                next_attempt_at: Instant::now(),
                backoff_secs: 0,
                connecting: false,
            });
    }

    pub fn unregister(&self, address: &str) -> bool {
        self.peers.lock().remove(address).is_some()
    }

    pub fn state(&self, address: &str) -> Option<PersistentPeerState> {
        self.peers.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Backoff after `failures` consecutive failures.
    pub fn backoff_for(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(32);
        self.base_backoff_secs
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_secs)
    }

    /// Persistent peers that should be dialled now. They are marked
    /// `connecting` until [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn due(&self, is_connected: impl Fn(&str) -> bool) -> Vec<String> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let mut due = Vec::new();
        for state in peers.values_mut() {
            if state.connecting || now < state.next_attempt_at || is_connected(&state.address) {
                continue;
            }
            state.connecting = true;
            due.push(state.address.clone());
        }
        due
    }

    pub fn record_success(&self, address: &str) {
        if let Some(state) = self.peers.lock().get_mut(address) {
            state.attempt_count = 0;
            state.backoff_secs = 0;
            state.next_attempt_at = Instant::now();
            state.connecting = false;
        }
    }

    /// Returns the backoff now in force for `address`.
    pub fn record_failure(&self, address: &str) -> Option<u64> {
        let mut peers = self.peers.lock();
        let state = peers.get_mut(address)?;
        state.attempt_count = state.attempt_count.saturating_add(1);
        state.backoff_secs = self.backoff_for(state.attempt_count);
        state.next_attempt_at = Instant::now() + Duration::from_secs(state.backoff_secs);
        state.connecting = false;
        Some(state.backoff_secs)
    }

    /// Dial every due persistent peer in the background.
    pub fn sweep(self: &Arc<Self>, transport: &Arc<Transport>) -> usize {
        let due = self.due(|address| {
            transport.is_connected_to(address) || transport.connections().is_dialing(address)
        });
        let count = due.len();
        for address in due {
            let supervisor = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                match transport.connect(&address).await {
                    Ok(peer) => {
                        info!("🔁 Reconnected to persistent peer {} ({})", address, peer.peer_id);
                        supervisor.record_success(&address);
                    }
                    Err(e) => {
                        let backoff = supervisor.record_failure(&address).unwrap_or_default();
                        let attempts = supervisor
                            .state(&address)
                            .map(|s| s.attempt_count)
                            .unwrap_or_default();
                        warn!(
                            "Connection to {} failed (attempt {}): {}. Retrying in {}s",
                            address, attempts, e, backoff
                        );
                    }
                }
            });
        }
        if count > 0 {
            debug!("Reconnect sweep dialling {} persistent peers", count);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let supervisor = ReconnectSupervisor::new(1, 300);
        let waits: Vec<u64> = (1..=10).map(|n| supervisor.backoff_for(n)).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
        assert_eq!(supervisor.backoff_for(64), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_delays_next_attempt_and_success_resets() {
        let supervisor = ReconnectSupervisor::new(2, 60);
        supervisor.register("10.0.0.1:9333");

        assert_eq!(supervisor.due(|_| false), vec!["10.0.0.1:9333".to_string()]);
        // In flight: not handed out twice
        assert!(supervisor.due(|_| false).is_empty());

        assert_eq!(supervisor.record_failure("10.0.0.1:9333"), Some(2));
        assert!(supervisor.due(|_| false).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(supervisor.due(|_| false).len(), 1);
        assert_eq!(supervisor.record_failure("10.0.0.1:9333"), Some(4));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(supervisor.due(|_| false).len(), 1);
        supervisor.record_success("10.0.0.1:9333");

        let state = supervisor.state("10.0.0.1:9333").unwrap();
        assert_eq!(state.attempt_count, 0);
        assert_eq!(state.backoff_secs, 0);
        assert!(!state.connecting);
    }

    #[tokio::test]
    async fn test_connected_peers_are_not_due() {
        let supervisor = ReconnectSupervisor::new(1, 10);
        supervisor.register("a:1");
        supervisor.register("b:2");
        supervisor.register("a:1");
        assert_eq!(supervisor.len(), 2);

        let due = supervisor.due(|address| address == "a:1");
        assert_eq!(due, vec!["b:2".to_string()]);

        assert!(supervisor.unregister("b:2"));
        assert!(supervisor.state("b:2").is_none());
        assert!(!supervisor.unregister("b:2"));
    }
}
