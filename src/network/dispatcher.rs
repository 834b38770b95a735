//! Per-peer message queues in front of the message handler.
//!
//! Each peer gets its own worker task, so messages from one peer are handled
//! in arrival order while a slow answer to one peer never holds up another.
//! Workers exit after sitting idle and are respawned on the next message.

use crate::network::message_handler::MessageHandler;
use crate::network::transport::InboundMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::debug;

/// Messages buffered per peer before new ones are dropped.
pub const PEER_QUEUE_DEPTH: usize = 256;

/// Idle time after which a peer's worker exits.
pub const WORKER_IDLE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, message: InboundMessage);
}

#[async_trait]
impl Dispatch for MessageHandler {
    async fn dispatch(&self, message: InboundMessage) {
        MessageHandler::dispatch(self, message).await
    }
}

pub struct PeerDispatcher {
    handler: Arc<dyn Dispatch>,
    queues: DashMap<String, mpsc::Sender<InboundMessage>>,
    depth: usize,
    idle: Duration,
}

impl PeerDispatcher {
    pub fn new(handler: Arc<dyn Dispatch>) -> Self {
        Self::with_limits(handler, PEER_QUEUE_DEPTH, WORKER_IDLE)
    }

    pub fn with_limits(handler: Arc<dyn Dispatch>, depth: usize, idle: Duration) -> Self {
        Self {
            handler,
            queues: DashMap::new(),
            depth: depth.max(1),
            idle,
        }
    }

    /// Queue `message` behind earlier ones from the same peer. Never waits;
    /// returns `false` when the peer's queue is full and the message is dropped.
    pub fn submit(&self, message: InboundMessage) -> bool {
        let peer_id = message.peer_id.clone();
        let mut message = message;
        // A closed queue belongs to a worker that just went idle; retry once on a fresh one
        for _ in 0..2 {
            let sender = self
                .queues
                .entry(peer_id.clone())
                .or_insert_with(|| self.spawn_worker())
                .clone();
            match sender.try_send(message) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    debug!("Queue for {} is full, dropping message", peer_id);
                    return false;
                }
                Err(TrySendError::Closed(returned)) => {
                    self.queues
                        .remove_if(&peer_id, |_, queued| queued.same_channel(&sender));
                    message = returned;
                }
            }
        }
        false
    }

    /// Drop the queue of a disconnected peer. Already queued messages are
    /// still handled.
    pub fn forget(&self, peer_id: &str) {
        self.queues.remove(peer_id);
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn spawn_worker(&self) -> mpsc::Sender<InboundMessage> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(self.depth);
        let handler = self.handler.clone();
        let idle = self.idle;
        tokio::spawn(async move {
            loop {
                match timeout(idle, rx.recv()).await {
                    Ok(Some(message)) => handler.dispatch(message).await,
                    Ok(None) => break,
                    Err(_) => {
                        // Refuse new messages, then finish what already arrived
                        rx.close();
                        while let Ok(message) = rx.try_recv() {
                            handler.dispatch(message).await;
                        }
                        break;
                    }
                }
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Payload;
    use crate::network::transport::Origin;
    use crate::types::NodeId;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Records handled messages; messages from `stalled` wait for `release`.
    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<(String, u64)>>,
        stalled: Option<String>,
        release: Notify,
    }

    #[async_trait]
    impl Dispatch for Recorder {
        async fn dispatch(&self, message: InboundMessage) {
            if self.stalled.as_deref() == Some(message.peer_id.as_str()) {
                self.release.notified().await;
            }
            let nonce = match message.payload {
                Payload::Ping { nonce, .. } => nonce,
                _ => 0,
            };
            self.handled.lock().push((message.peer_id, nonce));
        }
    }

    fn ping(peer_id: &str, nonce: u64) -> InboundMessage {
        InboundMessage {
            peer_id: peer_id.to_string(),
            remote_address: "10.4.4.4:9333".parse().unwrap(),
            sender: NodeId([4u8; 32]),
            origin: Origin::Stream,
            payload: Payload::Ping { nonce, height: 1 },
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_others() {
        let recorder = Arc::new(Recorder {
            stalled: Some("slow".to_string()),
            ..Recorder::default()
        });
        let dispatcher = PeerDispatcher::new(recorder.clone());

        assert!(dispatcher.submit(ping("slow", 1)));
        assert!(dispatcher.submit(ping("fast", 2)));
        assert!(dispatcher.submit(ping("fast", 3)));
        settle().await;
        assert_eq!(
            recorder.handled.lock().clone(),
            vec![("fast".to_string(), 2), ("fast".to_string(), 3)]
        );

        recorder.release.notify_one();
        settle().await;
        assert_eq!(recorder.handled.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_messages_from_one_peer_keep_their_order() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = PeerDispatcher::new(recorder.clone());

        for nonce in 1..=20 {
            assert!(dispatcher.submit(ping("peer", nonce)));
        }
        settle().await;
        let nonces: Vec<u64> = recorder
            .handled
            .lock()
            .iter()
            .map(|(_, nonce)| *nonce)
            .collect();
        assert_eq!(nonces, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_waiting() {
        let recorder = Arc::new(Recorder {
            stalled: Some("slow".to_string()),
            ..Recorder::default()
        });
        let dispatcher = PeerDispatcher::with_limits(recorder.clone(), 2, WORKER_IDLE);

        // One in the worker, two queued
        assert!(dispatcher.submit(ping("slow", 1)));
        settle().await;
        assert!(dispatcher.submit(ping("slow", 2)));
        assert!(dispatcher.submit(ping("slow", 3)));
        assert!(!dispatcher.submit(ping("slow", 4)));
        assert!(dispatcher.submit(ping("other", 5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_is_replaced() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = PeerDispatcher::with_limits(recorder.clone(), 8, Duration::from_secs(1));

        assert!(dispatcher.submit(ping("peer", 1)));
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert!(dispatcher.submit(ping("peer", 2)));
        settle().await;
        assert_eq!(
            recorder.handled.lock().clone(),
            vec![("peer".to_string(), 1), ("peer".to_string(), 2)]
        );
        assert_eq!(dispatcher.queue_count(), 1);
    }
}
