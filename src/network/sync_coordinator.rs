//! Sync Coordinator - Prevents overlapping sync runs and sync storms
//!
//! Every trigger (periodic timer, height mismatch seen in peer traffic,
//! a block from the future) goes through [`SyncCoordinator::request_sync`]:
//!
//! - at most one synchronization run at a time
//! - on-demand triggers are throttled to one per `min_trigger_interval_secs`
//! - after `max_consecutive_failures` failed rounds the coordinator cools
//!   down for `failure_cooldown_secs` and refuses every trigger

use crate::config::SyncConfig;
use crate::network::chain_sync::{ChainSynchronizer, SyncOutcome};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source that triggered a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Periodic chain comparison
    Periodic,
    /// A peer advertised or delivered something beyond our tip
    OnDemand,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Periodic => write!(f, "Periodic"),
            SyncTrigger::OnDemand => write!(f, "OnDemand"),
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    last_on_demand: Option<Instant>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// Statistics about sync coordination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCoordinatorStats {
    pub running: bool,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
}

pub struct SyncCoordinator {
    synchronizer: Arc<ChainSynchronizer>,
    running: tokio::sync::Mutex<()>,
    state: Mutex<CoordinatorState>,
    min_trigger_interval: Duration,
    max_consecutive_failures: u32,
    failure_cooldown: Duration,
}

impl SyncCoordinator {
    pub fn new(synchronizer: Arc<ChainSynchronizer>, config: &SyncConfig) -> Self {
        Self {
            synchronizer,
            running: tokio::sync::Mutex::new(()),
            state: Mutex::new(CoordinatorState::default()),
            min_trigger_interval: Duration::from_secs(config.min_trigger_interval_secs),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            failure_cooldown: Duration::from_secs(config.failure_cooldown_secs),
        }
    }

    /// Admission checks that do not need the run lock.
    fn admit(&self, trigger: SyncTrigger) -> Result<(), String> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Err(format!(
                    "cooling down after {} failed rounds, {:?} left",
                    self.max_consecutive_failures,
                    until - now
                ));
            }
            state.cooldown_until = None;
        }

        if trigger == SyncTrigger::OnDemand {
            if let Some(last) = state.last_on_demand {
                let elapsed = now - last;
                if elapsed < self.min_trigger_interval {
                    return Err(format!("throttled: last trigger {:?} ago", elapsed));
                }
            }
            state.last_on_demand = Some(now);
        }
        Ok(())
    }

    fn record(&self, outcome: &SyncOutcome) {
        let mut state = self.state.lock();
        match outcome {
            SyncOutcome::Failed { .. } => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.max_consecutive_failures {
                    warn!(
                        "⚠️  {} consecutive sync failures, pausing sync for {:?}",
                        state.consecutive_failures, self.failure_cooldown
                    );
                    state.consecutive_failures = 0;
                    state.cooldown_until = Some(Instant::now() + self.failure_cooldown);
                }
            }
            SyncOutcome::Skipped(_) => {}
            _ => state.consecutive_failures = 0,
        }
    }

    /// Run one synchronization if admission allows it.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        if let Err(reason) = self.admit(trigger) {
            debug!("⏱️ {} sync skipped: {}", trigger, reason);
            return SyncOutcome::Skipped(reason);
        }

        let Ok(_guard) = self.running.try_lock() else {
            debug!("🔄 {} sync skipped: a run is already active", trigger);
            return SyncOutcome::Skipped("sync already running".to_string());
        };

        let started = Instant::now();
        let outcome = self.synchronizer.synchronize().await;
        self.record(&outcome);

        match &outcome {
            SyncOutcome::Failed { .. } => warn!(
                "❌ {} sync {} ({:?})",
                trigger,
                outcome,
                started.elapsed()
            ),
            SyncOutcome::UpToDate { .. } | SyncOutcome::Skipped(_) => {
                debug!("{} sync {}", trigger, outcome)
            }
            _ => info!("✅ {} sync {} ({:?})", trigger, outcome, started.elapsed()),
        }
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub fn stats(&self) -> SyncCoordinatorStats {
        let state = self.state.lock();
        SyncCoordinatorStats {
            running: self.is_running(),
            consecutive_failures: state.consecutive_failures,
            cooling_down: state
                .cooldown_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::network::block_source::{BlockSource, ChainSummary, FetchError, SyncPeer};
    use crate::types::{build_chain, Block, CheckpointMeta, CheckpointPayload};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One peer that claims height 10 but never serves any blocks.
    #[derive(Default)]
    struct LyingSource {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl BlockSource for LyingSource {
        async fn peers(&self) -> Vec<SyncPeer> {
            vec![SyncPeer {
                peer_id: "liar".to_string(),
                advertised_height: 10,
                reputation: 0,
            }]
        }

        async fn chain_summary(&self, peer: &SyncPeer) -> Result<ChainSummary, FetchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(ChainSummary {
                peer_id: peer.peer_id.clone(),
                reported_height: 10,
                latest: None,
                reputation: 0,
            })
        }

        async fn blocks(&self, peer_id: &str, _: u64, _: u64) -> Result<Vec<Block>, FetchError> {
            Err(FetchError::UnknownPeer(peer_id.to_string()))
        }

        async fn checkpoint(&self, _: &str) -> Result<Option<CheckpointMeta>, FetchError> {
            Ok(None)
        }

        async fn checkpoint_payload(
            &self,
            _: &str,
            _: u64,
        ) -> Result<Option<CheckpointPayload>, FetchError> {
            Ok(None)
        }

        async fn full_chains(&self, _: Duration) -> Vec<(String, Vec<Block>)> {
            Vec::new()
        }
    }

    fn coordinator(source: Arc<LyingSource>) -> SyncCoordinator {
        let config = SyncConfig {
            max_consecutive_failures: 2,
            failure_cooldown_secs: 300,
            min_trigger_interval_secs: 5,
            ..SyncConfig::default()
        };
        let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::with_chain(build_chain(3)));
        let synchronizer = Arc::new(ChainSynchronizer::new(ledger, source, config.clone()));
        SyncCoordinator::new(synchronizer, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_consecutive_failures() {
        let source = Arc::new(LyingSource::default());
        let coordinator = coordinator(source.clone());

        assert!(coordinator.request_sync(SyncTrigger::Periodic).await.is_failure());
        assert!(coordinator.request_sync(SyncTrigger::Periodic).await.is_failure());
        assert!(coordinator.stats().cooling_down);

        let probes = source.probes.load(Ordering::SeqCst);
        assert!(matches!(
            coordinator.request_sync(SyncTrigger::Periodic).await,
            SyncOutcome::Skipped(_)
        ));
        assert_eq!(source.probes.load(Ordering::SeqCst), probes);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(coordinator.request_sync(SyncTrigger::Periodic).await.is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_triggers_are_throttled() {
        let source = Arc::new(LyingSource::default());
        let coordinator = coordinator(source);

        assert!(coordinator.request_sync(SyncTrigger::OnDemand).await.is_failure());
        assert!(matches!(
            coordinator.request_sync(SyncTrigger::OnDemand).await,
            SyncOutcome::Skipped(_)
        ));
        // Periodic runs are not throttled
        assert!(coordinator.request_sync(SyncTrigger::Periodic).await.is_failure());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_refused() {
        let source = Arc::new(LyingSource::default());
        let coordinator = coordinator(source);

        let _held = coordinator.running.lock().await;
        assert!(coordinator.is_running());
        assert_eq!(
            coordinator.request_sync(SyncTrigger::Periodic).await,
            SyncOutcome::Skipped("sync already running".to_string())
        );
    }
}
