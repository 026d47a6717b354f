//! One height at a time, all-or-nothing
use super::{BlockSource, RpcError};
use crate::{prelude::*, BlockData, BlockMeta};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{what} for {height}H: {source}")]
    Rpc {
        height: BlockHeight,
        what: &'static str,
        #[source]
        source: RpcError,
    },
    /// The node changed its mind between the calls, usually a reorg in progress
    #[error("inconsistent data for {height}H: {detail}")]
    Inconsistent { height: BlockHeight, detail: String },
}

impl FetchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Rpc { source, .. } if source.is_fatal())
    }

    pub fn is_not_yet_mined(&self) -> bool {
        matches!(
            self,
            FetchError::Rpc {
                source: RpcError::HeightNotYetMined(_),
                ..
            }
        )
    }

    /// Lower is more important when several sub-fetches fail at once
    fn precedence(&self) -> u8 {
        if self.is_fatal() {
            0
        } else if self.is_not_yet_mined() {
            1
        } else {
            2
        }
    }
}

/// Fetches hash, header and stats of a height and checks that they describe
/// the same block
///
/// Stats are fetched by height alongside the hash; the header is then looked
/// up by that hash, so a height costs three calls.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn BlockSource>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.source
    }

    pub fn fetch(&self, height: BlockHeight) -> Result<BlockData, FetchError> {
        let source = &*self.source;
        let wrap = |what: &'static str| {
            move |source: RpcError| FetchError::Rpc {
                height,
                what,
                source,
            }
        };

        let (hash, header, stats) = std::thread::scope(|s| {
            let stats = s.spawn(|| source.fetch_stats(height).map_err(wrap("stats")));
            let hash = source.fetch_hash(height).map_err(wrap("hash"));
            let header = hash.clone().and_then(|hash| {
                source
                    .fetch_header_of(height, &hash)
                    .map_err(wrap("header"))
            });
            (hash, header, join(stats))
        });

        let (hash, header, stats) = match (hash, header, stats) {
            (Ok(hash), Ok(header), Ok(stats)) => (hash, header, stats),
            (hash, header, stats) => {
                let mut errors: Vec<FetchError> = [hash.err(), header.err(), stats.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                errors.sort_by_key(FetchError::precedence);
                return Err(errors.remove(0));
            }
        };

        let inconsistent = |detail: String| FetchError::Inconsistent { height, detail };
        if header.hash != hash {
            return Err(inconsistent(format!(
                "header hash {} != block hash {}",
                header.hash, hash
            )));
        }
        if stats.block_hash != hash {
            return Err(inconsistent(format!(
                "stats hash {} != block hash {}",
                stats.block_hash, hash
            )));
        }
        if header.height != height || stats.height != height {
            return Err(inconsistent(format!(
                "header at {}H, stats at {}H",
                header.height, stats.height
            )));
        }

        Ok(BlockData {
            height,
            id: hash,
            data: BlockMeta { header, stats },
        })
    }
}

fn join<T>(handle: std::thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(res) => res,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
