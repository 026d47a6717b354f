//! The only code path that writes block records
use super::{Ack, BlockStore, StoreError};
use crate::{
    prelude::*,
    util::{trace_time, RetryPolicy},
    BlockData,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct UpsertWriter {
    store: Arc<dyn BlockStore>,
    retry: RetryPolicy,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn BlockStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Commit one height, retrying conflicts and outages
    ///
    /// Conflicts are retried without waiting; outages back off.
    pub fn commit(&self, block: &BlockData) -> Result<Ack, StoreError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let res = trace_time(
                || self.store.commit(block),
                |duration, change| {
                    trace!(
                        "Committed {}H ({:?}) in {}ms",
                        block.height,
                        change,
                        duration.as_millis()
                    )
                },
            );

            match res {
                Ok(change) => {
                    return Ok(Ack {
                        height: block.height,
                        hash: block.id,
                        change,
                    })
                }
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    let delay = match e {
                        StoreError::Conflict(_) => std::time::Duration::ZERO,
                        _ => self.retry.delay(attempts),
                    };
                    warn!(
                        "Commit of {}H failed (attempt {}/{}): {}; retrying in {:?}",
                        block.height, attempts, self.retry.max_attempts, e, delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
