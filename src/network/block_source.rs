//! Where the synchronizer gets blocks from.
//!
//! [`BlockSource`] is the seam between the sync state machine and the
//! network. [`PeerBlockSource`] fetches block ranges over a peer's HTTP
//! endpoint when it advertised one, and over `get_chain_range` otherwise.
//! Checkpoints always travel over the P2P connection.

use crate::network::http_api::BlocksResponse;
use crate::network::message::Payload;
use crate::network::reputation::ReputationEvent;
use crate::network::transport::{Transport, TransportError};
use crate::types::{Block, BlockDescriptor, CheckpointMeta, CheckpointPayload};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Blocks asked for by a height probe; the answer's `total` is what matters.
const PROBE_LIMIT: u64 = 1;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),
    #[error("peer {0} is not connected")]
    UnknownPeer(String),
}

/// A peer the synchronizer may ask for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPeer {
    pub peer_id: String,
    pub advertised_height: u64,
    pub reputation: i32,
}

/// Probe result for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    pub peer_id: String,
    pub reported_height: u64,
    pub latest: Option<BlockDescriptor>,
    pub reputation: i32,
}

#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn peers(&self) -> Vec<SyncPeer>;

    async fn chain_summary(&self, peer: &SyncPeer) -> Result<ChainSummary, FetchError>;

    /// Blocks `[offset, offset + limit)` as the peer holds them.
    async fn blocks(&self, peer_id: &str, offset: u64, limit: u64) -> Result<Vec<Block>, FetchError>;

    async fn checkpoint(&self, peer_id: &str) -> Result<Option<CheckpointMeta>, FetchError>;

    async fn checkpoint_payload(
        &self,
        peer_id: &str,
        height: u64,
    ) -> Result<Option<CheckpointPayload>, FetchError>;

    /// Whole chains offered by every reachable peer within `window`.
    async fn full_chains(&self, window: Duration) -> Vec<(String, Vec<Block>)>;

    /// Feedback on a peer's answer, used for peer ordering.
    fn report(&self, _peer_id: &str, _useful: bool) {}
}

pub struct PeerBlockSource {
    transport: Arc<Transport>,
    http: reqwest::Client,
    timeout: Duration,
}

impl PeerBlockSource {
    pub fn new(transport: Arc<Transport>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("⚠️  HTTP client setup failed, using defaults without timeout: {}", e);
                reqwest::Client::new()
            });
        Self {
            transport,
            http,
            timeout,
        }
    }

    fn api_endpoint(&self, peer_id: &str) -> Option<String> {
        self.transport
            .registry()
            .get(peer_id)
            .and_then(|peer| peer.api_endpoint)
    }

    async fn http_blocks(
        &self,
        endpoint: &str,
        offset: u64,
        limit: u64,
    ) -> Result<BlocksResponse, FetchError> {
        let url = format!("{}/blocks", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<BlocksResponse>().await?)
    }

    async fn p2p_range(
        &self,
        peer_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(u64, Vec<Block>), FetchError> {
        let request = Payload::GetChainRange {
            offset,
            limit,
            include_pending: false,
        };
        match self.transport.request(peer_id, request, self.timeout).await? {
            Payload::ChainRange { total, blocks, .. } => Ok((total, blocks)),
            other => Err(FetchError::UnexpectedResponse(other.message_type())),
        }
    }
}

#[async_trait]
impl BlockSource for PeerBlockSource {
    async fn peers(&self) -> Vec<SyncPeer> {
        let gate = self.transport.gate();
        self.transport
            .registry()
            .ready_peers()
            .into_iter()
            .map(|peer| SyncPeer {
                reputation: gate.reputation(&peer.remote_address.ip()),
                peer_id: peer.peer_id,
                advertised_height: peer.advertised_height,
            })
            .collect()
    }

    async fn chain_summary(&self, peer: &SyncPeer) -> Result<ChainSummary, FetchError> {
        if let Some(endpoint) = self.api_endpoint(&peer.peer_id) {
            match self.http_blocks(&endpoint, 0, PROBE_LIMIT).await {
                Ok(response) => {
                    return Ok(ChainSummary {
                        peer_id: peer.peer_id.clone(),
                        reported_height: response.total,
                        latest: response.latest,
                        reputation: peer.reputation,
                    })
                }
                Err(e) => debug!("HTTP probe of {} failed, using P2P: {}", peer.peer_id, e),
            }
        }

        let (total, _) = self.p2p_range(&peer.peer_id, 0, PROBE_LIMIT).await?;
        Ok(ChainSummary {
            peer_id: peer.peer_id.clone(),
            reported_height: total,
            latest: None,
            reputation: peer.reputation,
        })
    }

    async fn blocks(&self, peer_id: &str, offset: u64, limit: u64) -> Result<Vec<Block>, FetchError> {
        if self.transport.registry().get(peer_id).is_none() {
            return Err(FetchError::UnknownPeer(peer_id.to_string()));
        }
        if let Some(endpoint) = self.api_endpoint(peer_id) {
            match self.http_blocks(&endpoint, offset, limit).await {
                Ok(response) => return Ok(response.blocks),
                Err(e) => debug!("HTTP fetch from {} failed, using P2P: {}", peer_id, e),
            }
        }
        Ok(self.p2p_range(peer_id, offset, limit).await?.1)
    }

    async fn checkpoint(&self, peer_id: &str) -> Result<Option<CheckpointMeta>, FetchError> {
        match self
            .transport
            .request(peer_id, Payload::GetCheckpoint, self.timeout)
            .await?
        {
            Payload::Checkpoint(meta) => Ok(meta),
            other => Err(FetchError::UnexpectedResponse(other.message_type())),
        }
    }

    async fn checkpoint_payload(
        &self,
        peer_id: &str,
        height: u64,
    ) -> Result<Option<CheckpointPayload>, FetchError> {
        match self
            .transport
            .request(peer_id, Payload::CheckpointRequest { height }, self.timeout)
            .await?
        {
            Payload::CheckpointPayload(payload) => Ok(payload),
            other => Err(FetchError::UnexpectedResponse(other.message_type())),
        }
    }

    async fn full_chains(&self, window: Duration) -> Vec<(String, Vec<Block>)> {
        self.transport
            .broadcast_request(Payload::GetChain, window)
            .await
            .into_iter()
            .filter_map(|(peer_id, response)| match response {
                Payload::Chain { blocks } => Some((peer_id, blocks)),
                _ => None,
            })
            .collect()
    }

    fn report(&self, peer_id: &str, useful: bool) {
        if let Some(peer) = self.transport.registry().get(peer_id) {
            let event = if useful {
                ReputationEvent::UsefulResponse
            } else {
                ReputationEvent::FailedResponse
            };
            self.transport
                .gate()
                .record_reputation(peer.remote_address.ip(), event);
        }
    }
}
