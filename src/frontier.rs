//! Which heights need (re)fetching
//!
//! Pure bookkeeping plus one walk against node and store: nothing here writes.
use crate::{
    db::{BlockStore, StoreError},
    node::{BlockSource, RpcError},
    prelude::*,
};
use itertools::Itertools;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrontierError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Heights above what's stored, up to the node's tip, ascending
///
/// `start` is where an empty store begins. Nothing to do when the store is
/// at or past the tip; a tip that went backwards is not acted on here.
pub fn compute_worklist(
    local_max: Option<BlockHeight>,
    remote_tip: BlockHeight,
    start: BlockHeight,
) -> Vec<BlockHeight> {
    let from = match local_max {
        Some(local_max) if local_max >= remote_tip => return vec![],
        Some(local_max) => (local_max + 1).max(start),
        None => start,
    };
    if from > remote_tip {
        return vec![];
    }
    (from..=remote_tip).collect()
}

/// Does a freshly seen `previous_block_hash` contradict the stored chain?
///
/// Without a stored predecessor there's nothing to contradict.
pub fn detect_reorg(
    height: BlockHeight,
    expected_prev: Option<&BlockHash>,
    observed_prev: Option<&BlockHash>,
) -> bool {
    match (expected_prev, observed_prev) {
        (Some(expected), Some(observed)) => expected != observed,
        (Some(_), None) => height > 0,
        (None, _) => false,
    }
}

/// Walk down from `from` until stored and node hashes agree
///
/// Returns the highest agreeing height, or `None` if nothing down to `floor`
/// agrees (everything from `floor` up has to be fetched again). A height the
/// node no longer has, or that isn't stored, counts as disagreement.
pub fn find_reconvergence(
    source: &dyn BlockSource,
    store: &dyn BlockStore,
    from: BlockHeight,
    floor: BlockHeight,
) -> Result<Option<BlockHeight>, FrontierError> {
    if from < floor {
        return Ok(None);
    }
    for height in (floor..=from).rev() {
        let stored = store.hash_at(height)?;
        let remote = match source.fetch_hash(height) {
            Ok(hash) => Some(hash),
            Err(RpcError::HeightNotYetMined(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match (stored, remote) {
            (Some(stored), Some(remote)) if stored == remote => return Ok(Some(height)),
            (stored, remote) => debug!(
                "Reorg walk at {}H: stored {:?}, node {:?}",
                height, stored, remote
            ),
        }
    }
    Ok(None)
}

/// Highest tip seen during this run
///
/// Nodes behind load balancers can answer from a lagging backend; a lower
/// tip than one already seen is logged and ignored.
#[derive(Debug, Default)]
pub struct TipObserver {
    best: Option<BlockHeight>,
}

impl TipObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, tip: BlockHeight) -> BlockHeight {
        match self.best {
            Some(best) if tip < best => {
                warn!(
                    "Node tip went back from {}H to {}H; ignoring",
                    best, tip
                );
                best
            }
            _ => {
                self.best = Some(tip);
                tip
            }
        }
    }

    /// Accept `tip` even if lower, after a reorg confirmed the chain shrank
    pub fn reset(&mut self, tip: BlockHeight) {
        self.best = Some(tip);
    }
}

/// `[1, 2, 3, 7, 9, 10]` -> `[(1, 3), (7, 7), (9, 10)]`
pub fn collapse_ranges(heights: &[BlockHeight]) -> Vec<(BlockHeight, BlockHeight)> {
    heights
        .iter()
        .map(|&h| (h, h))
        .coalesce(|(a_from, a_to), (b_from, b_to)| {
            if a_to.checked_add(1) == Some(b_from) {
                Ok((a_from, b_to))
            } else {
                Err(((a_from, a_to), (b_from, b_to)))
            }
        })
        .collect()
}
