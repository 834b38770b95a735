//! Shutdown manager for graceful daemon termination.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Manages graceful shutdown of the node's tasks
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn register_tasks(&mut self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.task_handles.extend(handles);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Wait for ctrl+c, or for something else to cancel the token, then shut down.
    pub async fn wait_for_shutdown(self) -> bool {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("🛑 Shutdown signal received");
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
        self.shutdown(SHUTDOWN_GRACE).await
    }

    /// Cancel every task and wait up to `grace` for them to finish.
    /// Returns whether all of them did.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<_> = self.task_handles.drain(..).collect();
        let shutdown_tasks = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(grace, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_stop_on_cancel() {
        let mut manager = ShutdownManager::new();
        for _ in 0..3 {
            let token = manager.token();
            manager.register_task(tokio::spawn(async move { token.cancelled().await }));
        }
        assert_eq!(manager.task_count(), 3);
        assert!(manager.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_hits_grace_timeout() {
        let mut manager = ShutdownManager::new();
        manager.register_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        assert!(!manager.shutdown(Duration::from_secs(10)).await);
    }
}
