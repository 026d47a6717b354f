//! Bitcoin block metadata indexer
//!
//! Pulls block headers, block stats and block hashes out of a node's JSON-RPC
//! interface and keeps three height-keyed Postgres tables in sync with the
//! node's best chain, including through reorgs and restarts.
//!
//! The moving parts, leaf first:
//!
//! * [`node::rpc::RpcClient`] - typed JSON-RPC calls with retry/backoff
//! * [`frontier`] - which heights to (re)fetch, and where a reorg reconverges
//! * [`node::fetcher::Fetcher`] - one height's header/stats/hash as a unit
//! * [`db::writer::UpsertWriter`] - atomic, idempotent per-height commits
//! * [`driver::Driver`] - passes, worker pool, checkpoint and reorg checks

pub mod config;
pub mod db;
pub mod driver;
pub mod frontier;
pub mod node;
pub mod opts;
pub mod prelude;
pub mod types;
pub mod util;

pub use bitcoin::BlockHash;
pub use node::RpcInfo;
pub use types::{BlockData, BlockHeader, BlockMeta, BlockStats};

pub type BlockHeight = u32;
