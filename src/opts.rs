use clap::{Args, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(name = "blockmeta-indexer", about = "Bitcoin block metadata indexer")]
pub struct Opts {
    /// Path to .env file to load (overrides default .env in current directory)
    #[arg(long = "env-file", value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Drop schema/data using wipe.sql and exit
    #[arg(long = "wipe-db", alias = "wipe-whole-db")]
    pub wipe_db: bool,

    /// Sync until caught up with the node, then exit
    #[arg(long)]
    pub once: bool,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Flags that take precedence over the environment
#[derive(Debug, Args, Clone, Default)]
pub struct ConfigOverrides {
    /// Node JSON-RPC url [env: NODE_RPC_URL]
    #[arg(long, value_name = "URL")]
    pub node_rpc_url: Option<String>,

    /// Postgres url [env: DATABASE_URL]
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Concurrent heights in flight [env: INDEXER_WORKERS]
    #[arg(long)]
    pub workers: Option<usize>,

    /// Heights at the checkpoint re-checked on startup [env: INDEXER_REWIND]
    #[arg(long)]
    pub rewind: Option<u32>,

    /// First height to index into an empty store [env: INDEXER_START_HEIGHT]
    #[arg(long)]
    pub start_height: Option<u32>,

    /// Most heights scheduled per pass [env: INDEXER_PASS_LIMIT]
    #[arg(long)]
    pub pass_limit: Option<usize>,
}
