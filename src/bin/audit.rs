//! Where the store stands relative to the node
//!
//! Prints, per table, the highest stored height and how far behind the node
//! it is, then the checkpoint, stalled heights and any holes.
use blockmeta_indexer::{
    config::Config,
    db::{pg::PgStore, BlockStore},
    frontier::collapse_ranges,
    node::BlockSource,
    opts::ConfigOverrides,
    prelude::*,
    RpcInfo,
};

fn behind(tip: BlockHeight, head: Option<BlockHeight>) -> String {
    match head {
        Some(head) if head >= tip => format!("{}H (in sync)", head),
        Some(head) => format!("{}H ({} blocks behind)", head, tip - head),
        None => "empty".into(),
    }
}

fn run() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env(&ConfigOverrides::default())?;

    let rpc = RpcInfo::from_url(&config.node_rpc_url)?
        .with_token(config.node_rpc_token.clone())
        .to_rpc_client(config.rpc)?;
    let store = PgStore::new(config.database_url.clone(), 1)?;

    let tip = rpc.fetch_tip_height()?;
    let heads = store.table_heads()?;
    println!("node tip:      {}H", tip);
    println!("block_hashes:  {}", behind(tip, heads.hashes));
    println!("block_headers: {}", behind(tip, heads.headers));
    println!("block_stats:   {}", behind(tip, heads.stats));

    match store.checkpoint()? {
        Some(cp) => println!("checkpoint:    {}H", cp),
        None => println!("checkpoint:    none"),
    }

    let stalled = store.stalled_heights()?;
    if stalled.is_empty() {
        println!("stalled:       none");
    } else {
        println!("stalled:");
        for s in stalled {
            println!("  {}H after {} attempts: {}", s.height, s.attempts, s.last_error);
        }
    }

    let top = [heads.hashes, heads.headers, heads.stats]
        .iter()
        .flatten()
        .copied()
        .max();
    if let Some(top) = top {
        let gaps = store.missing_heights(config.sync.start_height, top)?;
        if gaps.is_empty() {
            println!("gaps:          none");
        } else {
            println!("gaps:          {} heights", gaps.len());
            for (from, to) in collapse_ranges(&gaps) {
                if from == to {
                    println!("  {}H", from);
                } else {
                    println!("  {}H..={}H", from, to);
                }
            }
        }
    }

    Ok(())
}

fn main() {
    let _ = env_logger::try_init();
    if let Err(e) = run() {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
