//! Scripted in-memory node for tests
use super::{BlockSource, RpcError};
use crate::{prelude::*, BlockHeader, BlockStats};
use bitcoin::hashes::Hash;
use rust_decimal::Decimal;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Tip,
    Hash,
    Header,
    Stats,
}

#[derive(Default)]
struct Inner {
    /// index is the height
    hashes: Vec<BlockHash>,
    reported_tip: Option<BlockHeight>,
    failures: HashMap<(Call, BlockHeight), (RpcError, Option<u32>)>,
    skewed_stats: HashSet<BlockHeight>,
    calls: HashMap<Call, Vec<BlockHeight>>,
}

pub struct MockChain {
    inner: Mutex<Inner>,
}

pub fn mock_hash(seed: u8, height: BlockHeight) -> BlockHash {
    let mut bytes = [0x5au8; 32];
    bytes[0] = seed;
    bytes[1..5].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

impl MockChain {
    /// Chain `0..=tip`
    pub fn new(tip: BlockHeight) -> Self {
        let chain = Self {
            inner: Mutex::new(Inner::default()),
        };
        chain.fork(0, tip, 0);
        chain
    }

    /// Replace everything from `at` up with a branch ending at `new_tip`
    pub fn fork(&self, at: BlockHeight, new_tip: BlockHeight, seed: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.hashes.truncate(at as usize);
        for h in at..=new_tip {
            inner.hashes.push(mock_hash(seed, h));
        }
    }

    /// Make `getblockcount` lie
    pub fn report_tip(&self, tip: Option<BlockHeight>) {
        self.inner.lock().unwrap().reported_tip = tip;
    }

    /// Fail `call` at `height` with `err`, `times` times or forever
    ///
    /// `Call::Tip` failures are keyed at height 0. `Some(0)` clears the failure.
    pub fn fail(&self, call: Call, height: BlockHeight, err: RpcError, times: Option<u32>) {
        let mut inner = self.inner.lock().unwrap();
        if times == Some(0) {
            inner.failures.remove(&(call, height));
        } else {
            inner.failures.insert((call, height), (err, times));
        }
    }

    /// Stats at `height` describe some other block
    pub fn skew_stats(&self, height: BlockHeight) {
        self.inner.lock().unwrap().skewed_stats.insert(height);
    }

    pub fn calls(&self, call: Call) -> Vec<BlockHeight> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(&call)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tip(&self) -> BlockHeight {
        self.inner.lock().unwrap().hashes.len() as BlockHeight - 1
    }

    pub fn hash(&self, height: BlockHeight) -> BlockHash {
        self.inner.lock().unwrap().hashes[height as usize]
    }

    fn enter(&self, call: Call, height: BlockHeight) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.entry(call).or_default().push(height);
        let key = (call, height);
        let (err, exhausted) = match inner.failures.get_mut(&key) {
            None => return Ok(()),
            Some((err, None)) => (err.clone(), false),
            Some((err, Some(times))) => {
                *times = times.saturating_sub(1);
                (err.clone(), *times == 0)
            }
        };
        if exhausted {
            inner.failures.remove(&key);
        }
        Err(err)
    }

    fn hash_opt(&self, height: BlockHeight) -> Option<BlockHash> {
        self.inner
            .lock()
            .unwrap()
            .hashes
            .get(height as usize)
            .copied()
    }

    fn mined(&self, height: BlockHeight) -> Result<BlockHash, RpcError> {
        self.hash_opt(height)
            .ok_or(RpcError::HeightNotYetMined(height))
    }
}

impl BlockSource for MockChain {
    fn fetch_tip_height(&self) -> Result<BlockHeight, RpcError> {
        self.enter(Call::Tip, 0)?;
        let reported = self.inner.lock().unwrap().reported_tip;
        Ok(reported.unwrap_or_else(|| self.tip()))
    }

    fn fetch_hash(&self, height: BlockHeight) -> Result<BlockHash, RpcError> {
        self.enter(Call::Hash, height)?;
        self.mined(height)
    }

    fn fetch_header(&self, height: BlockHeight) -> Result<BlockHeader, RpcError> {
        let hash = self.mined(height)?;
        self.fetch_header_of(height, &hash)
    }

    fn fetch_header_of(
        &self,
        height: BlockHeight,
        hash: &BlockHash,
    ) -> Result<BlockHeader, RpcError> {
        self.enter(Call::Header, height)?;
        let hash = *hash;
        self.mined(height)?;
        let tip = self.tip();
        Ok(BlockHeader {
            hash,
            confirmations: i64::from(tip - height + 1),
            height,
            version: 0x2000_0000,
            version_hex: "20000000".into(),
            merkle_root: format!("{:064x}", u64::from(height) * 7 + 1),
            time: 1_231_006_505 + i64::from(height) * 600,
            median_time: 1_231_006_505 + i64::from(height.saturating_sub(5)) * 600,
            nonce: i64::from(height),
            bits: "1d00ffff".into(),
            difficulty: Decimal::ONE,
            chainwork: format!("{:064x}", u64::from(height) + 1),
            n_tx: 1,
            previous_block_hash: height.checked_sub(1).and_then(|h| self.hash_opt(h)),
            next_block_hash: self.hash_opt(height + 1),
        })
    }

    fn fetch_stats(&self, height: BlockHeight) -> Result<BlockStats, RpcError> {
        self.enter(Call::Stats, height)?;
        let mut block_hash = self.mined(height)?;
        if self.inner.lock().unwrap().skewed_stats.contains(&height) {
            block_hash = mock_hash(0xff, height);
        }
        let h = i64::from(height);
        Ok(BlockStats {
            block_hash,
            height,
            total_fee: h * 10,
            avg_fee: h,
            avg_fee_rate: Decimal::new(h * 25, 1),
            avg_tx_size: 250,
            txs: 10,
            time: 1_231_006_505 + h * 600,
            median_time: 1_231_006_505 + (h - 5).max(0) * 600,
            ins: 9,
            outs: 20,
            min_fee: 0,
            max_fee: h * 3,
            median_fee: h,
            min_fee_rate: Decimal::ONE,
            max_fee_rate: Decimal::new(h * 101, 2),
            min_tx_size: 100,
            max_tx_size: 400,
            median_tx_size: 250,
            segwit_txs: 4,
            segwit_total_size: 1000,
            segwit_total_weight: 2500,
            total_out: 5_000_000_000,
            total_size: 2500,
            total_weight: 9000,
            subsidy: 5_000_000_000,
            utxo_increase: 11,
            utxo_size_increase: 800,
            utxo_increase_actual: Some(11),
            utxo_size_increase_actual: None,
        })
    }
}
