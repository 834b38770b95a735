//! Chain synchronization state machine.
//!
//! One run walks the tiers in order and stops at the first that makes
//! progress:
//!
//! 1. checkpoint fast path, when the best advertised checkpoint is far ahead
//! 2. height probe of every ready peer
//! 3. parallel chunked download with rotated peer order per chunk
//! 4. single-peer bulk download from the highest peer
//! 5. full-chain gossip, adopting the longest valid chain
//!
//! Downloaded blocks never reach the ledger until the whole range has been
//! fetched and every chunk validated. Heights are block counts: the missing
//! range of a node at height `L` behind a peer at `H` is `[L, H)`.

use crate::config::SyncConfig;
use crate::ledger::{Ledger, LedgerError};
use crate::network::block_source::{BlockSource, ChainSummary, FetchError, SyncPeer};
use crate::network::message::MAX_RANGE_BLOCKS;
use crate::types::Block;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("chunk {range} failed: {reason}")]
    Chunk { range: ChunkRange, reason: String },
    #[error("no peer can serve {0}")]
    NoEligiblePeer(ChunkRange),
    #[error("invalid blocks: {0}")]
    InvalidBlocks(String),
    #[error("no usable chain offered")]
    NoChain,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate { height: u64 },
    Checkpoint { from: u64, to: u64 },
    Parallel { from: u64, to: u64 },
    Bulk { from: u64, to: u64 },
    Gossip { from: u64, to: u64 },
    Failed { height: u64, reason: String },
    Skipped(String),
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. })
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::UpToDate { height } => write!(f, "up to date at height {}", height),
            SyncOutcome::Checkpoint { from, to } => write!(f, "checkpoint {} → {}", from, to),
            SyncOutcome::Parallel { from, to } => write!(f, "parallel sync {} → {}", from, to),
            SyncOutcome::Bulk { from, to } => write!(f, "bulk sync {} → {}", from, to),
            SyncOutcome::Gossip { from, to } => write!(f, "gossip sync {} → {}", from, to),
            SyncOutcome::Failed { height, reason } => {
                write!(f, "failed at height {}: {}", height, reason)
            }
            SyncOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// Half-open height range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Split `[start, end)` into contiguous chunks of at most `chunk_size` blocks.
pub fn partition(start: u64, end: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor.saturating_add(chunk_size).min(end);
        chunks.push(ChunkRange {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    chunks
}

/// Peer order for chunk `index`: the base order rotated left by `index`.
pub fn rotated<T: Clone>(peers: &[T], index: usize) -> Vec<T> {
    if peers.is_empty() {
        return Vec::new();
    }
    let mut order = peers.to_vec();
    order.rotate_left(index % peers.len());
    order
}

/// A validated run of blocks covering exactly one range.
#[derive(Debug, Clone)]
pub struct SyncChunk {
    pub range: ChunkRange,
    pub blocks: Vec<Block>,
}

impl SyncChunk {
    /// Accept `blocks` only if they are exactly `range`: right count,
    /// ascending without gaps, hash-linked, with intact hashes.
    pub fn validate(range: ChunkRange, blocks: Vec<Block>) -> Result<Self, String> {
        if blocks.len() as u64 != range.len() {
            return Err(format!(
                "expected {} blocks, got {}",
                range.len(),
                blocks.len()
            ));
        }
        for (offset, block) in blocks.iter().enumerate() {
            let expected = range.start + offset as u64;
            if block.height != expected {
                return Err(format!(
                    "expected height {}, got {}",
                    expected, block.height
                ));
            }
            if !block.hash_is_valid() {
                return Err(format!("block {} has an invalid hash", block.height));
            }
        }
        for pair in blocks.windows(2) {
            if pair[1].previous_hash != pair[0].hash {
                return Err(format!("block {} does not link to its parent", pair[1].height));
            }
        }
        Ok(Self { range, blocks })
    }
}

/// Validate a whole chain from genesis.
fn validate_full_chain(chain: Vec<Block>) -> Result<Vec<Block>, String> {
    let range = ChunkRange {
        start: 0,
        end: chain.len() as u64,
    };
    SyncChunk::validate(range, chain).map(|chunk| chunk.blocks)
}

/// Order candidates by reputation, then reported height, both descending.
fn order_peers(summaries: &[ChainSummary]) -> Vec<ChainSummary> {
    let mut ordered = summaries.to_vec();
    ordered.sort_by(|a, b| {
        b.reputation
            .cmp(&a.reputation)
            .then(b.reported_height.cmp(&a.reported_height))
            .then(a.peer_id.cmp(&b.peer_id))
    });
    ordered
}

pub struct ChainSynchronizer {
    ledger: Arc<dyn Ledger>,
    source: Arc<dyn BlockSource>,
    config: SyncConfig,
}

impl ChainSynchronizer {
    pub fn new(ledger: Arc<dyn Ledger>, source: Arc<dyn BlockSource>, config: SyncConfig) -> Self {
        Self {
            ledger,
            source,
            config,
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.probe_timeout_secs)
    }

    fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.config.chunk_timeout_secs)
    }

    /// Run every tier in order until one makes progress.
    pub async fn synchronize(&self) -> SyncOutcome {
        let start_height = self.ledger.height().await;
        let peers = self.source.peers().await;
        if peers.is_empty() {
            return SyncOutcome::Skipped("no ready peers".to_string());
        }

        let checkpoint = if self.config.checkpoint_enabled {
            self.checkpoint_fast_path(start_height, &peers).await
        } else {
            None
        };

        let local = self.ledger.height().await;
        let summaries = self.probe(&peers).await;
        let Some(best) = summaries
            .iter()
            .filter(|s| s.reported_height > local)
            .max_by_key(|s| s.reported_height)
            .cloned()
        else {
            return checkpoint.unwrap_or(SyncOutcome::UpToDate { height: local });
        };

        let target = best.reported_height;
        let gap = target - local;
        info!(
            "🔄 Behind by {} blocks (local {}, best {} at {})",
            gap, local, best.peer_id, target
        );

        let parallel = self.config.parallel_enabled
            && (gap > self.config.parallel_gap_threshold
                || summaries
                    .iter()
                    .any(|s| s.reported_height > self.config.parallel_peer_height_threshold));
        if parallel {
            match self.parallel_sync(local, target, &summaries).await {
                Ok(to) => {
                    return SyncOutcome::Parallel {
                        from: start_height,
                        to,
                    }
                }
                Err(e) => warn!("⚠️  Parallel sync failed, falling back to bulk: {}", e),
            }
        }

        match self.bulk_sync(local, &best).await {
            Ok(to) => {
                return SyncOutcome::Bulk {
                    from: start_height,
                    to,
                }
            }
            Err(e) => warn!("⚠️  Bulk sync from {} failed, falling back to gossip: {}", best.peer_id, e),
        }

        match self.gossip_sync(local).await {
            Ok(to) => SyncOutcome::Gossip {
                from: start_height,
                to,
            },
            Err(e) => SyncOutcome::Failed {
                height: self.ledger.height().await,
                reason: e.to_string(),
            },
        }
    }

    /// Apply the best advertised checkpoint if it is far enough ahead.
    async fn checkpoint_fast_path(&self, local: u64, peers: &[SyncPeer]) -> Option<SyncOutcome> {
        let probes = peers.iter().map(|peer| async move {
            let result = timeout(self.probe_timeout(), self.source.checkpoint(&peer.peer_id)).await;
            match result {
                Ok(Ok(Some(meta))) => Some((peer.peer_id.clone(), meta)),
                _ => None,
            }
        });
        let (peer_id, meta) = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .max_by_key(|(_, meta)| meta.height)?;

        // A checkpoint at block index h leaves the chain at height h + 1
        let checkpoint_height = meta.height + 1;
        if checkpoint_height <= local || checkpoint_height - local <= self.config.checkpoint_min_gap {
            return None;
        }

        info!(
            "⚡ Checkpoint at {} from {} is {} blocks ahead",
            meta.height,
            peer_id,
            checkpoint_height - local
        );
        let payload = match timeout(
            self.chunk_timeout(),
            self.source.checkpoint_payload(&peer_id, meta.height),
        )
        .await
        {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => {
                debug!("{} no longer serves checkpoint {}", peer_id, meta.height);
                return None;
            }
            Ok(Err(e)) => {
                warn!("⚠️  Checkpoint download from {} failed: {}", peer_id, e);
                self.source.report(&peer_id, false);
                return None;
            }
            Err(_) => {
                warn!("⚠️  Checkpoint download from {} timed out", peer_id);
                self.source.report(&peer_id, false);
                return None;
            }
        };

        if payload.meta != meta || !payload.is_consistent() {
            warn!("⚠️  Inconsistent checkpoint payload from {}", peer_id);
            self.source.report(&peer_id, false);
            return None;
        }
        match self.ledger.apply_checkpoint(payload).await {
            Ok(()) => {
                self.source.report(&peer_id, true);
                let to = self.ledger.height().await;
                info!("✅ Applied checkpoint, height {} → {}", local, to);
                Some(SyncOutcome::Checkpoint { from: local, to })
            }
            Err(e) => {
                warn!("⚠️  Ledger rejected checkpoint from {}: {}", peer_id, e);
                None
            }
        }
    }

    /// Ask every peer for its height; silent or failing peers are left out.
    pub async fn probe(&self, peers: &[SyncPeer]) -> Vec<ChainSummary> {
        let probes = peers.iter().map(|peer| async move {
            match timeout(self.probe_timeout(), self.source.chain_summary(peer)).await {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(e)) => {
                    debug!("Probe of {} failed: {}", peer.peer_id, e);
                    None
                }
                Err(_) => {
                    debug!("Probe of {} timed out", peer.peer_id);
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Download `[local, target)` in parallel chunks and apply it only if every chunk arrives.
    async fn parallel_sync(
        &self,
        local: u64,
        target: u64,
        summaries: &[ChainSummary],
    ) -> Result<u64, SyncError> {
        let chunks = partition(local, target, self.config.chunk_size);
        let ordered = order_peers(summaries);
        info!(
            "📦 Parallel sync of [{}, {}) in {} chunks over {} workers",
            local,
            target,
            chunks.len(),
            self.config.workers
        );

        let mut fetched: Vec<SyncChunk> = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, range)| self.fetch_chunk(index, range, &ordered))
            .buffer_unordered(self.config.workers.max(1))
            .try_collect()
            .await?;
        fetched.sort_by_key(|chunk| chunk.range.start);

        let blocks: Vec<Block> = fetched.into_iter().flat_map(|chunk| chunk.blocks).collect();
        self.apply(local, blocks).await
    }

    /// Fetch one chunk, walking the rotated peer order until an attempt validates.
    pub async fn fetch_chunk(
        &self,
        index: usize,
        range: ChunkRange,
        ordered: &[ChainSummary],
    ) -> Result<SyncChunk, SyncError> {
        let eligible: Vec<ChainSummary> = ordered
            .iter()
            .filter(|peer| peer.reported_height >= range.end)
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(SyncError::NoEligiblePeer(range));
        }

        let order = rotated(&eligible, index);
        let attempts = order.len().max(self.config.retry_limit as usize);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let peer = &order[attempt % order.len()];
            let result = timeout(
                self.chunk_timeout(),
                self.source.blocks(&peer.peer_id, range.start, range.len()),
            )
            .await;

            let error = match result {
                Ok(Ok(blocks)) => match SyncChunk::validate(range, blocks) {
                    Ok(chunk) => {
                        self.source.report(&peer.peer_id, true);
                        debug!("Chunk {} from {}", range, peer.peer_id);
                        return Ok(chunk);
                    }
                    Err(reason) => reason,
                },
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            self.source.report(&peer.peer_id, false);
            debug!(
                "Chunk {} attempt {}/{} from {} failed: {}",
                range,
                attempt + 1,
                attempts,
                peer.peer_id,
                error
            );
            last_error = error;
        }

        Err(SyncError::Chunk {
            range,
            reason: last_error,
        })
    }

    /// Fetch the whole missing range from the highest peer in one request.
    async fn bulk_sync(&self, local: u64, best: &ChainSummary) -> Result<u64, SyncError> {
        let range = ChunkRange {
            start: local,
            end: best.reported_height,
        };
        info!("📦 Bulk sync of {} from {}", range, best.peer_id);

        // Peers cap each answer, so the range is paged from the same peer
        let mut blocks = Vec::new();
        let mut cursor = range.start;
        while cursor < range.end {
            let page = ChunkRange {
                start: cursor,
                end: range.end.min(cursor.saturating_add(MAX_RANGE_BLOCKS)),
            };
            let fetched = timeout(
                self.chunk_timeout(),
                self.source.blocks(&best.peer_id, page.start, page.len()),
            )
            .await
            .map_err(|_| SyncError::Chunk {
                range: page,
                reason: "timed out".to_string(),
            })??;
            if fetched.is_empty() || fetched.len() as u64 > page.len() {
                break;
            }
            cursor = cursor.saturating_add(fetched.len() as u64);
            blocks.extend(fetched);
        }

        let chunk = SyncChunk::validate(range, blocks).map_err(|reason| {
            self.source.report(&best.peer_id, false);
            SyncError::Chunk { range, reason }
        })?;
        self.apply(local, chunk.blocks).await
    }

    /// Ask everyone for their full chain and adopt the longest valid one.
    async fn gossip_sync(&self, local: u64) -> Result<u64, SyncError> {
        let window = Duration::from_secs(self.config.gossip_window_secs);
        let offers = self.source.full_chains(window).await;
        info!("📣 Gossip sync collected {} chain offers", offers.len());

        let mut candidates: Vec<(String, Vec<Block>)> = offers
            .into_iter()
            .filter(|(_, chain)| chain.len() as u64 > local)
            .filter_map(|(peer_id, chain)| match validate_full_chain(chain) {
                Ok(chain) => Some((peer_id, chain)),
                Err(reason) => {
                    debug!("Discarding chain from {}: {}", peer_id, reason);
                    self.source.report(&peer_id, false);
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|(_, chain)| std::cmp::Reverse(chain.len()));

        for (peer_id, chain) in candidates {
            match self.ledger.replace_chain(chain).await {
                Ok(()) => {
                    self.source.report(&peer_id, true);
                    return Ok(self.ledger.height().await);
                }
                Err(e) => debug!("Ledger rejected chain from {}: {}", peer_id, e),
            }
        }
        Err(SyncError::NoChain)
    }

    /// Genesis-only chains are replaced wholesale; otherwise blocks are
    /// appended until the ledger rejects one.
    async fn apply(&self, local: u64, blocks: Vec<Block>) -> Result<u64, SyncError> {
        if local <= 1 {
            let mut chain = self.ledger.blocks(0, local).await;
            chain.extend(blocks);
            self.ledger.replace_chain(chain).await?;
            return Ok(self.ledger.height().await);
        }

        let mut applied = 0usize;
        for block in blocks {
            let height = block.height;
            match self.ledger.append_block(block).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("⚠️  Ledger rejected block {}: {}", height, e);
                    if applied == 0 {
                        return Err(e.into());
                    }
                    break;
                }
            }
        }
        let height = self.ledger.height().await;
        info!("✅ Applied {} blocks, height now {}", applied, height);
        Ok(height)
    }
}
