//! Ledger collaborator boundary.
//!
//! The network layer never mutates chain state directly: every block,
//! transaction, replacement chain and checkpoint goes through [`Ledger`],
//! which owns the validity rules. [`MemoryLedger`] is the in-process
//! implementation used by the daemon and by tests.

use crate::types::{
    Block, BlockDescriptor, CheckpointMeta, CheckpointPayload, Hash256, Transaction,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block height {got} does not extend chain of height {expected}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("block {0} does not link to the current tip")]
    BrokenLink(u64),

    #[error("block {0} has an invalid hash")]
    InvalidHash(u64),

    #[error("transaction {0} has an invalid id")]
    InvalidTransaction(Hash256),

    #[error("transaction {0} already known")]
    DuplicateTransaction(Hash256),

    #[error("replacement chain rejected: {0}")]
    InvalidChain(String),

    #[error("checkpoint rejected: {0}")]
    InvalidCheckpoint(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Number of blocks in the chain, including any checkpointed prefix.
    async fn height(&self) -> u64;

    async fn latest(&self) -> Option<BlockDescriptor>;

    /// Blocks with heights in `[offset, offset + limit)` that are held locally.
    async fn blocks(&self, offset: u64, limit: u64) -> Vec<Block>;

    async fn block(&self, id: &Hash256) -> Option<Block>;

    async fn transaction(&self, id: &Hash256) -> Option<Transaction>;

    async fn has_block(&self, id: &Hash256) -> bool;

    async fn has_transaction(&self, id: &Hash256) -> bool;

    async fn pending_transactions(&self) -> Vec<Transaction>;

    /// Validate and append a block on top of the current tip.
    async fn append_block(&self, block: Block) -> Result<(), LedgerError>;

    /// Validate and admit a transaction to the pending pool.
    async fn admit_transaction(&self, tx: Transaction) -> Result<(), LedgerError>;

    /// Replace the whole chain with a strictly longer valid one.
    async fn replace_chain(&self, chain: Vec<Block>) -> Result<(), LedgerError>;

    /// Best checkpoint this ledger can serve.
    async fn checkpoint(&self) -> Option<CheckpointMeta>;

    async fn checkpoint_payload(&self, height: u64) -> Option<CheckpointPayload>;

    /// Privileged state replace from a checkpoint snapshot.
    async fn apply_checkpoint(&self, payload: CheckpointPayload) -> Result<(), LedgerError>;
}

struct LedgerState {
    /// Height of `blocks[0]`; non-zero after a checkpoint was applied.
    base: u64,
    blocks: Vec<Block>,
    index: HashMap<Hash256, u64>,
    pending: HashMap<Hash256, Transaction>,
    seen_transactions: HashSet<Hash256>,
    snapshot: Vec<u8>,
}

impl LedgerState {
    fn height(&self) -> u64 {
        self.base + self.blocks.len() as u64
    }

    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn get(&self, height: u64) -> Option<&Block> {
        if height < self.base {
            return None;
        }
        self.blocks.get((height - self.base) as usize)
    }

    fn reindex(&mut self) {
        self.index = self
            .blocks
            .iter()
            .map(|b| (b.hash, b.height))
            .collect::<HashMap<_, _>>();
    }
}

/// In-memory hash-linked chain.
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    checkpoint_interval: u64,
}

impl MemoryLedger {
    pub fn new(genesis: Block) -> Self {
        Self::with_chain(vec![genesis])
    }

    /// Starts from an already-built chain. The chain is trusted as-is.
    pub fn with_chain(blocks: Vec<Block>) -> Self {
        let base = blocks.first().map(|b| b.height).unwrap_or(0);
        let mut state = LedgerState {
            base,
            blocks,
            index: HashMap::new(),
            pending: HashMap::new(),
            seen_transactions: HashSet::new(),
            snapshot: Vec::new(),
        };
        state.reindex();
        Self {
            state: RwLock::new(state),
            checkpoint_interval: 1000,
        }
    }

    /// Heights that are multiples of `interval` are advertised as checkpoints.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Snapshot bytes installed by the last applied checkpoint.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.read().await.snapshot.clone()
    }

    /// Verify heights, links and hashes of a chain starting at genesis.
    fn validate_chain(chain: &[Block]) -> Result<(), LedgerError> {
        let first = chain
            .first()
            .ok_or_else(|| LedgerError::InvalidChain("empty chain".to_string()))?;
        if first.height != 0 {
            return Err(LedgerError::InvalidChain(format!(
                "chain starts at height {}",
                first.height
            )));
        }
        if !first.hash_is_valid() {
            return Err(LedgerError::InvalidHash(0));
        }
        for pair in chain.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.height != prev.height + 1 {
                return Err(LedgerError::InvalidChain(format!(
                    "gap between {} and {}",
                    prev.height, next.height
                )));
            }
            if next.previous_hash != prev.hash {
                return Err(LedgerError::BrokenLink(next.height));
            }
            if !next.hash_is_valid() {
                return Err(LedgerError::InvalidHash(next.height));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn height(&self) -> u64 {
        self.state.read().await.height()
    }

    async fn latest(&self) -> Option<BlockDescriptor> {
        self.state.read().await.tip().map(Block::descriptor)
    }

    async fn blocks(&self, offset: u64, limit: u64) -> Vec<Block> {
        let state = self.state.read().await;
        let start = offset.max(state.base);
        let end = offset.saturating_add(limit).min(state.height());
        (start..end)
            .filter_map(|h| state.get(h).cloned())
            .collect()
    }

    async fn block(&self, id: &Hash256) -> Option<Block> {
        let state = self.state.read().await;
        let height = *state.index.get(id)?;
        state.get(height).cloned()
    }

    async fn transaction(&self, id: &Hash256) -> Option<Transaction> {
        self.state.read().await.pending.get(id).cloned()
    }

    async fn has_block(&self, id: &Hash256) -> bool {
        self.state.read().await.index.contains_key(id)
    }

    async fn has_transaction(&self, id: &Hash256) -> bool {
        self.state.read().await.seen_transactions.contains(id)
    }

    async fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().await.pending.values().cloned().collect()
    }

    async fn append_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        let expected = state.height();
        if block.height != expected {
            return Err(LedgerError::HeightMismatch {
                expected,
                got: block.height,
            });
        }
        if let Some(tip) = state.tip() {
            if block.previous_hash != tip.hash {
                return Err(LedgerError::BrokenLink(block.height));
            }
        }
        if !block.hash_is_valid() {
            return Err(LedgerError::InvalidHash(block.height));
        }
        state.index.insert(block.hash, block.height);
        state.blocks.push(block);
        Ok(())
    }

    async fn admit_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        if !tx.id_is_valid() {
            return Err(LedgerError::InvalidTransaction(tx.id));
        }
        let mut state = self.state.write().await;
        if !state.seen_transactions.insert(tx.id) {
            return Err(LedgerError::DuplicateTransaction(tx.id));
        }
        state.pending.insert(tx.id, tx);
        Ok(())
    }

    async fn replace_chain(&self, chain: Vec<Block>) -> Result<(), LedgerError> {
        Self::validate_chain(&chain)?;
        let mut state = self.state.write().await;
        if chain.len() as u64 <= state.height() {
            return Err(LedgerError::InvalidChain(format!(
                "candidate height {} is not longer than local {}",
                chain.len(),
                state.height()
            )));
        }
        if state.base == 0 {
            if let (Some(ours), Some(theirs)) = (state.blocks.first(), chain.first()) {
                if ours.hash != theirs.hash {
                    return Err(LedgerError::InvalidChain("genesis mismatch".to_string()));
                }
            }
        }
        state.base = 0;
        state.blocks = chain;
        state.reindex();
        Ok(())
    }

    async fn checkpoint(&self) -> Option<CheckpointMeta> {
        let state = self.state.read().await;
        let tip_height = state.tip()?.height;
        let height = tip_height - tip_height % self.checkpoint_interval;
        if height == 0 {
            return None;
        }
        let block = state.get(height)?;
        Some(CheckpointMeta {
            height,
            block_hash: block.hash,
            timestamp: block.timestamp,
            source: "local".to_string(),
        })
    }

    async fn checkpoint_payload(&self, height: u64) -> Option<CheckpointPayload> {
        let meta = self.checkpoint().await.filter(|m| m.height == height)?;
        let state = self.state.read().await;
        let tip = state.get(height)?.clone();
        Some(CheckpointPayload {
            meta,
            tip,
            state: state.snapshot.clone(),
        })
    }

    async fn apply_checkpoint(&self, payload: CheckpointPayload) -> Result<(), LedgerError> {
        if !payload.is_consistent() {
            return Err(LedgerError::InvalidCheckpoint(
                "tip does not match metadata".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        if payload.meta.height < state.height() {
            return Err(LedgerError::InvalidCheckpoint(format!(
                "checkpoint {} is behind local height {}",
                payload.meta.height,
                state.height()
            )));
        }
        state.base = payload.tip.height;
        state.blocks = vec![payload.tip];
        state.snapshot = payload.state;
        state.reindex();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::build_chain;

    #[tokio::test]
    async fn test_append_enforces_height_and_link() {
        let chain = build_chain(3);
        let ledger = MemoryLedger::new(chain[0].clone());

        assert_eq!(
            ledger.append_block(chain[2].clone()).await,
            Err(LedgerError::HeightMismatch {
                expected: 1,
                got: 2
            })
        );
        ledger.append_block(chain[1].clone()).await.unwrap();
        ledger.append_block(chain[2].clone()).await.unwrap();
        assert_eq!(ledger.height().await, 3);
        assert_eq!(ledger.latest().await, Some(chain[2].descriptor()));

        let stray = Block::new(3, Hash256([9u8; 32]), 0, vec![]);
        assert_eq!(
            ledger.append_block(stray).await,
            Err(LedgerError::BrokenLink(3))
        );
    }

    #[tokio::test]
    async fn test_replace_requires_longer_valid_chain() {
        let ledger = MemoryLedger::with_chain(build_chain(4));

        let shorter = build_chain(3);
        assert!(ledger.replace_chain(shorter).await.is_err());

        let mut broken = build_chain(6);
        broken[3].payload = b"forged".to_vec();
        assert!(ledger.replace_chain(broken).await.is_err());

        ledger.replace_chain(build_chain(6)).await.unwrap();
        assert_eq!(ledger.height().await, 6);
    }

    #[tokio::test]
    async fn test_transactions_are_admitted_once() {
        let ledger = MemoryLedger::new(Block::genesis());
        let tx = Transaction::new(b"pay".to_vec());

        ledger.admit_transaction(tx.clone()).await.unwrap();
        assert!(ledger.has_transaction(&tx.id).await);
        assert_eq!(
            ledger.admit_transaction(tx.clone()).await,
            Err(LedgerError::DuplicateTransaction(tx.id))
        );

        let mut forged = Transaction::new(b"x".to_vec());
        forged.payload = b"y".to_vec();
        assert!(ledger.admit_transaction(forged).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_between_ledgers() {
        let source = MemoryLedger::with_chain(build_chain(25)).with_checkpoint_interval(10);
        let meta = source.checkpoint().await.unwrap();
        assert_eq!(meta.height, 20);

        let payload = source.checkpoint_payload(20).await.unwrap();
        let target = MemoryLedger::new(Block::genesis());
        target.apply_checkpoint(payload).await.unwrap();

        assert_eq!(target.height().await, 21);
        assert!(target.blocks(0, 5).await.is_empty());
        assert_eq!(target.blocks(20, 5).await.len(), 1);

        let next = build_chain(22).pop().unwrap();
        target.append_block(next).await.unwrap();
        assert_eq!(target.height().await, 22);
    }
}
