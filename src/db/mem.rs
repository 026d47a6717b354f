//! In-memory [`BlockStore`]
//!
//! One mutex around everything, so commits are trivially atomic and
//! serialized. Used by tests and handy for dry runs against a node.
use super::{BlockStore, Change, ChainLink, StalledHeight, StoreError, TableHeads};
use crate::{prelude::*, BlockData, BlockHeader, BlockStats};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

#[derive(Default)]
struct Tables {
    hashes: BTreeMap<BlockHeight, BlockHash>,
    headers: BTreeMap<BlockHeight, BlockHeader>,
    stats: BTreeMap<BlockHeight, BlockStats>,
    checkpoint: Option<BlockHeight>,
    stalled: BTreeMap<BlockHeight, StalledHeight>,
    injected_failures: HashMap<BlockHeight, (StoreError, u32)>,
}

#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` commits of `height` fail with `err`; zero clears
    pub fn fail_next_commits(&self, height: BlockHeight, err: StoreError, times: u32) {
        let mut t = self.lock();
        if times == 0 {
            t.injected_failures.remove(&height);
        } else {
            t.injected_failures.insert(height, (err, times));
        }
    }

    pub fn header(&self, height: BlockHeight) -> Option<BlockHeader> {
        self.lock().headers.get(&height).cloned()
    }

    pub fn stats(&self, height: BlockHeight) -> Option<BlockStats> {
        self.lock().stats.get(&height).cloned()
    }

    pub fn hash(&self, height: BlockHeight) -> Option<BlockHash> {
        self.lock().hashes.get(&height).copied()
    }
}

impl BlockStore for MemStore {
    fn commit(&self, block: &BlockData) -> Result<Change, StoreError> {
        let mut t = self.lock();
        let height = block.height;

        if let Some((err, times)) = t.injected_failures.get_mut(&height) {
            let err = err.clone();
            *times = times.saturating_sub(1);
            if *times == 0 {
                t.injected_failures.remove(&height);
            }
            return Err(err);
        }

        let mut header = block.data.header.clone();
        if let Some(above) = t.headers.get(&(height + 1)) {
            if above.previous_block_hash == Some(block.id) {
                header.next_block_hash = Some(above.hash);
            }
        }

        let change = match t.hashes.get(&height) {
            None => Change::Inserted,
            Some(old) if *old != block.id => Change::Replaced,
            Some(_)
                if t.headers.get(&height) == Some(&header)
                    && t.stats.get(&height) == Some(&block.data.stats) =>
            {
                Change::Unchanged
            }
            Some(_) => Change::Updated,
        };

        if let Some(below) = height.checked_sub(1) {
            if let Some(below) = t.headers.get_mut(&below) {
                if header.previous_block_hash == Some(below.hash) {
                    below.next_block_hash = Some(block.id);
                }
            }
        }
        t.hashes.insert(height, block.id);
        t.headers.insert(height, header);
        t.stats.insert(height, block.data.stats.clone());
        t.stalled.remove(&height);

        Ok(change)
    }

    fn checkpoint(&self) -> Result<Option<BlockHeight>, StoreError> {
        Ok(self.lock().checkpoint)
    }

    fn set_checkpoint(&self, height: Option<BlockHeight>) -> Result<(), StoreError> {
        self.lock().checkpoint = height;
        Ok(())
    }

    fn max_committed_height(&self) -> Result<Option<BlockHeight>, StoreError> {
        Ok(self.lock().hashes.keys().next_back().copied())
    }

    fn hash_at(&self, height: BlockHeight) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.hash(height))
    }

    fn chain_links(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<ChainLink>, StoreError> {
        if to < from {
            return Ok(vec![]);
        }
        Ok(self
            .lock()
            .headers
            .range(from..=to)
            .map(|(height, header)| ChainLink {
                height: *height,
                hash: header.hash,
                previous_block_hash: header.previous_block_hash,
            })
            .collect())
    }

    fn missing_heights(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<BlockHeight>, StoreError> {
        if to < from {
            return Ok(vec![]);
        }
        let t = self.lock();
        Ok((from..=to)
            .filter(|h| {
                !(t.hashes.contains_key(h) && t.headers.contains_key(h) && t.stats.contains_key(h))
            })
            .collect())
    }

    fn rollback_from(&self, height: BlockHeight) -> Result<u64, StoreError> {
        let mut t = self.lock();
        let removed = t.hashes.split_off(&height).len() as u64;
        t.headers.split_off(&height);
        t.stats.split_off(&height);
        if let Some(below) = height.checked_sub(1) {
            if let Some(below) = t.headers.get_mut(&below) {
                below.next_block_hash = None;
            }
        }
        Ok(removed)
    }

    fn mark_stalled(
        &self,
        height: BlockHeight,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), StoreError> {
        self.lock().stalled.insert(
            height,
            StalledHeight {
                height,
                attempts,
                last_error: last_error.to_owned(),
            },
        );
        Ok(())
    }

    fn stalled_heights(&self) -> Result<Vec<StalledHeight>, StoreError> {
        Ok(self.lock().stalled.values().cloned().collect())
    }

    fn table_heads(&self) -> Result<TableHeads, StoreError> {
        let t = self.lock();
        Ok(TableHeads {
            hashes: t.hashes.keys().next_back().copied(),
            headers: t.headers.keys().next_back().copied(),
            stats: t.stats.keys().next_back().copied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{fetcher::Fetcher, mock::MockChain};
    use std::sync::Arc;

    fn filled(tip: BlockHeight) -> (Arc<MockChain>, MemStore) {
        let chain = Arc::new(MockChain::new(tip));
        let fetcher = Fetcher::new(chain.clone());
        let store = MemStore::new();
        for h in 0..=tip {
            store.commit(&fetcher.fetch(h).unwrap()).unwrap();
        }
        (chain, store)
    }

    #[test]
    fn rollback_removes_everything_above() {
        let (chain, store) = filled(10);
        assert_eq!(store.rollback_from(8).unwrap(), 3);
        assert_eq!(store.max_committed_height().unwrap(), Some(7));
        assert_eq!(
            store.table_heads().unwrap(),
            TableHeads {
                hashes: Some(7),
                headers: Some(7),
                stats: Some(7)
            }
        );
        assert_eq!(store.header(7).unwrap().next_block_hash, None);
        assert_eq!(store.hash_at(7).unwrap(), Some(chain.hash(7)));
    }

    #[test]
    fn reports_gaps() {
        let (_, store) = filled(10);
        store.lock().stats.remove(&4);
        store.lock().hashes.remove(&6);
        assert_eq!(store.missing_heights(0, 12).unwrap(), vec![4, 6, 11, 12]);
        assert_eq!(store.missing_heights(5, 4).unwrap(), Vec::<BlockHeight>::new());
    }

    #[test]
    fn commit_clears_stalled_mark() {
        let chain = Arc::new(MockChain::new(3));
        let store = MemStore::new();
        store.mark_stalled(2, 3, "stats: boom").unwrap();
        assert_eq!(store.stalled_heights().unwrap().len(), 1);

        store
            .commit(&Fetcher::new(chain).fetch(2).unwrap())
            .unwrap();
        assert!(store.stalled_heights().unwrap().is_empty());
    }

    #[test]
    fn zero_injected_failures_clears_them() {
        let chain = Arc::new(MockChain::new(3));
        let fetcher = Fetcher::new(chain);
        let store = MemStore::new();
        store.fail_next_commits(1, StoreError::Conflict("40001".into()), 2);
        store.fail_next_commits(1, StoreError::Conflict("40001".into()), 0);
        store.fail_next_commits(2, StoreError::Conflict("40001".into()), 0);

        assert_eq!(store.commit(&fetcher.fetch(1).unwrap()), Ok(Change::Inserted));
        assert_eq!(store.commit(&fetcher.fetch(2).unwrap()), Ok(Change::Inserted));
    }

    #[test]
    fn chain_links_cover_the_range() {
        let (chain, store) = filled(5);
        let links = store.chain_links(2, 4).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].previous_block_hash, Some(chain.hash(1)));
        assert_eq!(links[2].hash, chain.hash(4));
    }
}
