//! Persistence
//!
//! [`BlockStore`] is everything the sync pipeline needs from storage.
//! [`pg::PgStore`] is the real thing, [`mem::MemStore`] keeps the same
//! semantics in a few `BTreeMap`s.
use crate::{prelude::*, BlockData};

pub mod mem;
pub mod pg;
pub mod writer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection or resource trouble; worth retrying after a pause
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Lost a race with a concurrent transaction; retry right away
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

/// What a commit did to the height's records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Inserted,
    /// Byte-for-byte the same as what was stored
    Unchanged,
    /// Same block, some fields (eg. confirmations) moved
    Updated,
    /// Different block at this height
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub change: Change,
}

/// A stored header reduced to what reorg detection looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub previous_block_hash: Option<BlockHash>,
}

/// Highest height in each table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableHeads {
    pub hashes: Option<BlockHeight>,
    pub headers: Option<BlockHeight>,
    pub stats: Option<BlockHeight>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledHeight {
    pub height: BlockHeight,
    pub attempts: u32,
    pub last_error: String,
}

pub trait BlockStore: Send + Sync {
    /// Write hash, header and stats of one height atomically
    ///
    /// Also points `next_block_hash` of the height below at this block (if it
    /// links to it), fills this block's `next_block_hash` from the height
    /// above (if that links back), and clears the height's stalled mark.
    fn commit(&self, block: &BlockData) -> Result<Change, StoreError>;

    /// Every height at or below the checkpoint has been committed
    fn checkpoint(&self) -> Result<Option<BlockHeight>, StoreError>;
    fn set_checkpoint(&self, height: Option<BlockHeight>) -> Result<(), StoreError>;

    fn max_committed_height(&self) -> Result<Option<BlockHeight>, StoreError>;
    fn hash_at(&self, height: BlockHeight) -> Result<Option<BlockHash>, StoreError>;
    /// Stored headers in `[from, to]`, ascending
    fn chain_links(&self, from: BlockHeight, to: BlockHeight)
        -> Result<Vec<ChainLink>, StoreError>;
    /// Heights in `[from, to]` absent from any of the three tables
    fn missing_heights(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<BlockHeight>, StoreError>;

    /// Delete every record at `height` and above; returns how many heights went
    fn rollback_from(&self, height: BlockHeight) -> Result<u64, StoreError>;

    fn mark_stalled(
        &self,
        height: BlockHeight,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), StoreError>;
    fn stalled_heights(&self) -> Result<Vec<StalledHeight>, StoreError>;

    fn table_heads(&self) -> Result<TableHeads, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_outages_are_retryable() {
        assert!(StoreError::Conflict("40001".into()).is_retryable());
        assert!(StoreError::Unavailable("08006".into()).is_retryable());
        assert!(!StoreError::Fatal("23502".into()).is_retryable());
    }
}
