//! Canonical record shapes
//!
//! Field names on the wire follow Bitcoin Core's `getblockheader` and
//! `getblockstats` results; Rust names follow the database columns.
use crate::{BlockHash, BlockHeight};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Data with an id and a height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithHeightAndId<I, D> {
    pub height: BlockHeight,
    pub id: I,
    pub data: D,
}

/// Everything stored for one height: `id` is the `block_hashes` record
pub type BlockData = WithHeightAndId<BlockHash, BlockMeta>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub header: BlockHeader,
    pub stats: BlockStats,
}

/// `getblockheader <hash> true`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub confirmations: i64,
    pub height: BlockHeight,
    pub version: i32,
    #[serde(rename = "versionHex")]
    pub version_hex: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: i64,
    #[serde(rename = "mediantime")]
    pub median_time: i64,
    pub nonce: i64,
    pub bits: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub difficulty: Decimal,
    pub chainwork: String,
    #[serde(rename = "nTx")]
    pub n_tx: i64,
    /// Absent only for the genesis block
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<BlockHash>,
    /// Unknown until the successor exists
    #[serde(rename = "nextblockhash", default)]
    pub next_block_hash: Option<BlockHash>,
}

/// `getblockstats <height>`
///
/// Amounts are in satoshis, fee rates in sat/vB. Fee rates are kept as
/// decimals so that aggregating them downstream doesn't drift.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockStats {
    #[serde(rename = "blockhash")]
    pub block_hash: BlockHash,
    pub height: BlockHeight,
    #[serde(rename = "totalfee")]
    pub total_fee: i64,
    #[serde(rename = "avgfee")]
    pub avg_fee: i64,
    #[serde(rename = "avgfeerate", with = "rust_decimal::serde::float")]
    pub avg_fee_rate: Decimal,
    #[serde(rename = "avgtxsize")]
    pub avg_tx_size: i64,
    pub txs: i64,
    pub time: i64,
    #[serde(rename = "mediantime")]
    pub median_time: i64,
    pub ins: i64,
    pub outs: i64,
    #[serde(rename = "minfee")]
    pub min_fee: i64,
    #[serde(rename = "maxfee")]
    pub max_fee: i64,
    #[serde(rename = "medianfee")]
    pub median_fee: i64,
    #[serde(rename = "minfeerate", with = "rust_decimal::serde::float")]
    pub min_fee_rate: Decimal,
    #[serde(rename = "maxfeerate", with = "rust_decimal::serde::float")]
    pub max_fee_rate: Decimal,
    #[serde(rename = "mintxsize")]
    pub min_tx_size: i64,
    #[serde(rename = "maxtxsize")]
    pub max_tx_size: i64,
    #[serde(rename = "mediantxsize")]
    pub median_tx_size: i64,
    #[serde(rename = "swtxs")]
    pub segwit_txs: i64,
    #[serde(rename = "swtotal_size")]
    pub segwit_total_size: i64,
    #[serde(rename = "swtotal_weight")]
    pub segwit_total_weight: i64,
    pub total_out: i64,
    pub total_size: i64,
    pub total_weight: i64,
    pub subsidy: i64,
    pub utxo_increase: i64,
    #[serde(rename = "utxo_size_inc")]
    pub utxo_size_increase: i64,
    /// Only reported by nodes that track unspendable outputs (v25+)
    #[serde(default)]
    pub utxo_increase_actual: Option<i64>,
    #[serde(rename = "utxo_size_inc_actual", default)]
    pub utxo_size_increase_actual: Option<i64>,
}
