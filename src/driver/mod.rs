//! Reconciliation/backfill driver
//!
//! One *pass* is `Discovering -> Syncing -> ReorgCheck -> Idle`:
//!
//! * Discovering: ask the node for its tip, load the checkpoint, work out the
//!   worklist (new heights, holes, heights left stale by a reorg). The first
//!   pass of a process also re-checks the last few stored hashes against the
//!   node, since the chain may have moved while we were down.
//! * Syncing: a fixed pool of workers fetch and commit heights, in any order.
//!   Failed heights go to the back of the queue; after too many attempts
//!   they're marked stalled and left for the next pass.
//! * ReorgCheck: stored headers must link up across the checkpoint boundary
//!   and through everything committed. On a break, find where the chain
//!   agrees with the node again, lower the checkpoint to it and queue
//!   everything above for the next pass, which starts right away.
use crate::{
    config::{Config, ConfigError},
    db::{self, pg::PgStore, writer::UpsertWriter, BlockStore, Change, StoreError},
    frontier::{self, FrontierError, TipObserver},
    node::{fetcher::{FetchError, Fetcher}, BlockSource, RpcError, RpcInfo},
    prelude::*,
    util::{RetryPolicy, Shutdown},
};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

mod checkpoint;

pub use checkpoint::CheckpointTracker;

/// Heights this close to the tip are logged individually
const NEAR_TIP: BlockHeight = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub workers: usize,
    /// Fetch+commit attempts per height per pass before it's marked stalled
    pub height_max_attempts: u32,
    pub store_retry: RetryPolicy,
    /// How many heights at the checkpoint to re-check on the first pass
    pub revalidate_window: BlockHeight,
    /// Where an empty store starts
    pub start_height: BlockHeight,
    /// Most heights scheduled in one pass
    pub pass_limit: usize,
    pub poll_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            height_max_attempts: 3,
            store_retry: RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(30)),
            revalidate_window: 6,
            start_height: 0,
            pass_limit: 10_000,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let at_least_one = |name: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                    reason: "must be at least 1".into(),
                })
            } else {
                Ok(())
            }
        };
        at_least_one("INDEXER_WORKERS", self.workers as u64)?;
        at_least_one("INDEXER_HEIGHT_MAX_ATTEMPTS", u64::from(self.height_max_attempts))?;
        at_least_one("INDEXER_STORE_MAX_ATTEMPTS", u64::from(self.store_retry.max_attempts))?;
        at_least_one("INDEXER_PASS_LIMIT", self.pass_limit as u64)?;
        if self.store_retry.initial > self.store_retry.max {
            return Err(ConfigError::Inconsistent(format!(
                "store backoff initial {:?} exceeds max {:?}",
                self.store_retry.initial, self.store_retry.max
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Discovering,
    Syncing,
    ReorgCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgEvent {
    /// First height found disagreeing with the node
    pub detected_at: BlockHeight,
    /// Highest height where store and node agree; `None` if none above start
    pub reconverged_at: Option<BlockHeight>,
}

/// What a pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub remote_tip: Option<BlockHeight>,
    pub scheduled: usize,
    /// Heights written this pass, whatever the outcome
    pub committed: usize,
    pub unchanged: usize,
    pub replaced: usize,
    pub stalled: Vec<BlockHeight>,
    /// Lowest height the node said doesn't exist yet
    pub not_yet_mined: Option<BlockHeight>,
    pub reorg: Option<ReorgEvent>,
    pub checkpoint: Option<BlockHeight>,
    /// The worklist was cut at `pass_limit`
    pub truncated: bool,
    pub cancelled: bool,
}

impl PassReport {
    /// More work is known to be waiting; don't sleep before the next pass
    pub fn needs_another_pass(&self) -> bool {
        !self.cancelled && (self.reorg.is_some() || self.truncated)
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tip={} scheduled={} committed={} unchanged={} replaced={} stalled={} checkpoint={}",
            self.remote_tip.map_or("?".into(), |h| format!("{}H", h)),
            self.scheduled,
            self.committed,
            self.unchanged,
            self.replaced,
            self.stalled.len(),
            self.checkpoint.map_or("-".into(), |h| format!("{}H", h)),
        )?;
        if let Some(h) = self.not_yet_mined {
            write!(f, " not_yet_mined={}H", h)?;
        }
        if let Some(reorg) = self.reorg {
            write!(f, " reorg_at={}H", reorg.detected_at)?;
        }
        if self.truncated {
            write!(f, " truncated")?;
        }
        if self.cancelled {
            write!(f, " cancelled")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DriverError {
    /// Stop the run instead of trying again next pass
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::Rpc(e) => e.is_fatal(),
            DriverError::Store(_) => false,
            DriverError::Config(_) => true,
        }
    }
}

impl From<FrontierError> for DriverError {
    fn from(e: FrontierError) -> Self {
        match e {
            FrontierError::Rpc(e) => e.into(),
            FrontierError::Store(e) => e.into(),
        }
    }
}

/// Why one attempt at one height failed
#[derive(Debug, thiserror::Error)]
enum HeightFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type HeightResult = Result<db::Ack, HeightFailure>;

pub struct Driver {
    opts: SyncOptions,
    fetcher: Fetcher,
    writer: UpsertWriter,
    store: Arc<dyn BlockStore>,
    shutdown: Shutdown,
    tips: TipObserver,
    state: DriverState,
    first_pass: bool,
    /// Stored heights found stale, to be fetched again next pass
    pending_refetch: BTreeSet<BlockHeight>,
}

impl Driver {
    pub fn new(
        opts: SyncOptions,
        source: Arc<dyn BlockSource>,
        store: Arc<dyn BlockStore>,
        shutdown: Shutdown,
    ) -> Result<Self, DriverError> {
        opts.validate()?;
        Ok(Self {
            opts,
            fetcher: Fetcher::new(source),
            writer: UpsertWriter::new(store.clone(), opts.store_retry),
            store,
            shutdown,
            tips: TipObserver::new(),
            state: DriverState::Idle,
            first_pass: true,
            pending_refetch: BTreeSet::new(),
        })
    }

    /// Node RPC client and Postgres store as configured
    pub fn from_config(config: &Config, shutdown: Shutdown) -> Result<Self> {
        let rpc = RpcInfo::from_url(&config.node_rpc_url)?
            .with_token(config.node_rpc_token.clone())
            .to_rpc_client(config.rpc)?;
        let store = PgStore::new(config.database_url.clone(), config.db_pool_size)?;

        Ok(Self::new(
            config.sync,
            Arc::new(rpc),
            Arc::new(store),
            shutdown,
        )?)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn source(&self) -> &dyn BlockSource {
        &**self.fetcher.source()
    }

    /// Keep syncing until shut down, or until a fatal error
    pub fn run(&mut self) -> Result<(), DriverError> {
        while !self.shutdown.is_triggered() {
            match self.run_pass() {
                Ok(report) if report.cancelled => break,
                Ok(report) if report.needs_another_pass() => continue,
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(
                    "Pass failed: {}; retrying in {:?}",
                    e, self.opts.poll_interval
                ),
            }
            if !self.shutdown.sleep(self.opts.poll_interval) {
                break;
            }
        }
        info!("Shutting down");
        Ok(())
    }

    /// Run passes back to back until one finds nothing more waiting
    pub fn run_until_idle(&mut self) -> Result<PassReport, DriverError> {
        loop {
            let report = self.run_pass()?;
            if !report.needs_another_pass() {
                return Ok(report);
            }
        }
    }

    pub fn run_pass(&mut self) -> Result<PassReport, DriverError> {
        let res = self.run_pass_inner();
        self.state = DriverState::Idle;
        if let Ok(report) = &res {
            info!("Pass done: {}", report);
        }
        res
    }

    fn run_pass_inner(&mut self) -> Result<PassReport, DriverError> {
        let mut report = PassReport::default();

        self.state = DriverState::Discovering;
        let raw_tip = self.source().fetch_tip_height()?;
        let tip = self.tips.observe(raw_tip);
        report.remote_tip = Some(tip);

        let mut checkpoint = self.store.checkpoint()?;
        let max_committed = self.store.max_committed_height()?;
        let first_pass = self.first_pass;

        if first_pass {
            info!(
                "Node tip at {}H; store checkpoint {:?}, highest stored {:?}",
                tip, checkpoint, max_committed
            );
            // heights between the checkpoint and the top are covered by the
            // gap audit and by the linkage check from the checkpoint up
            if let Some(event) = self.revalidate(max_committed.map(|m| m.min(tip)))? {
                let lowered = event.reconverged_at;
                checkpoint = checkpoint.min(lowered);
                self.store.set_checkpoint(checkpoint)?;
                self.queue_refetch(lowered, max_committed.map(|m| m.min(tip)));
                report.reorg = Some(event);
            }
            self.first_pass = false;
        }

        let audit_from = match (first_pass, checkpoint) {
            (false, Some(cp)) => cp + 1,
            _ => self.opts.start_height,
        };
        let gaps = match max_committed {
            Some(max) => self.store.missing_heights(audit_from, max.min(tip))?,
            None => vec![],
        };
        if !gaps.is_empty() {
            info!(
                "Missing heights below {}H: {:?}",
                max_committed.unwrap_or(0),
                frontier::collapse_ranges(&gaps)
            );
        }

        let mut worklist: BTreeSet<BlockHeight> =
            frontier::compute_worklist(max_committed, tip, self.opts.start_height)
                .into_iter()
                .collect();
        worklist.extend(gaps);
        worklist.extend(std::mem::take(&mut self.pending_refetch));
        let mut worklist: Vec<BlockHeight> = worklist.into_iter().collect();
        if worklist.len() > self.opts.pass_limit {
            // leftovers are rediscovered next pass
            worklist.truncate(self.opts.pass_limit);
            report.truncated = true;
        }
        report.scheduled = worklist.len();

        let ceiling = if report.truncated {
            None
        } else {
            max_committed.map(|max| max.min(tip))
        };
        let mut tracker = CheckpointTracker::new(self.opts.start_height, &worklist, ceiling);

        self.state = DriverState::Syncing;
        let fatal = if worklist.is_empty() {
            None
        } else {
            self.sync(&worklist, tip, checkpoint, &mut tracker, &mut report)
        };

        report.checkpoint = tracker.checkpoint();
        if report.checkpoint != checkpoint {
            self.store.set_checkpoint(report.checkpoint)?;
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        if report.cancelled {
            return Ok(report);
        }

        self.state = DriverState::ReorgCheck;
        if let Some(event) = self.reorg_check(checkpoint, raw_tip, report.checkpoint)? {
            report.checkpoint = self.store.checkpoint()?;
            report.reorg = Some(event);
        }

        Ok(report)
    }

    /// Heights in `(above, upto]` must be fetched again
    fn queue_refetch(&mut self, above: Option<BlockHeight>, upto: Option<BlockHeight>) {
        let from = above.map_or(self.opts.start_height, |h| h + 1);
        if let Some(upto) = upto {
            self.pending_refetch.extend(from..=upto);
        }
    }

    /// Compare the last `revalidate_window` stored hashes up to `anchor` with
    /// the node's, and find the reconvergence point if they differ
    fn revalidate(&self, anchor: Option<BlockHeight>) -> Result<Option<ReorgEvent>, DriverError> {
        let anchor = match anchor {
            Some(anchor) if self.opts.revalidate_window > 0 => anchor,
            _ => return Ok(None),
        };
        let from = (anchor + 1)
            .saturating_sub(self.opts.revalidate_window)
            .max(self.opts.start_height);

        let mut detected_at = None;
        for height in from..=anchor {
            let remote = match self.source().fetch_hash(height) {
                Ok(hash) => Some(hash),
                Err(RpcError::HeightNotYetMined(_)) => None,
                Err(e) => return Err(e.into()),
            };
            if remote.is_none() || self.store.hash_at(height)? != remote {
                detected_at = Some(height);
                break;
            }
        }

        let detected_at = match detected_at {
            Some(h) => h,
            None => {
                debug!("Revalidated {}H..={}H: no changes", from, anchor);
                return Ok(None);
            }
        };
        let reconverged_at =
            frontier::find_reconvergence(self.source(), &*self.store, anchor, self.opts.start_height)?;
        warn!(
            "Stored chain diverged from the node at {}H while we were away; reconverged at {:?}",
            detected_at, reconverged_at
        );
        Ok(Some(ReorgEvent {
            detected_at,
            reconverged_at,
        }))
    }

    /// Check stored linkage from `boundary` up, and the stored hash at the
    /// node's tip if the node is behind us
    fn reorg_check(
        &mut self,
        boundary: Option<BlockHeight>,
        raw_tip: BlockHeight,
        checkpoint: Option<BlockHeight>,
    ) -> Result<Option<ReorgEvent>, DriverError> {
        let max = match self.store.max_committed_height()? {
            Some(max) => max,
            None => return Ok(None),
        };
        let from = boundary.unwrap_or(self.opts.start_height);

        let links = self.store.chain_links(from, max)?;
        let mut broken = links
            .windows(2)
            .find(|w| {
                w[1].height == w[0].height + 1
                    && frontier::detect_reorg(
                        w[1].height,
                        Some(&w[0].hash),
                        w[1].previous_block_hash.as_ref(),
                    )
            })
            .map(|w| (w[1].height, w[0].height));

        if broken.is_none() && raw_tip < max {
            let remote = self.source().fetch_hash(raw_tip)?;
            if self.store.hash_at(raw_tip)? != Some(remote) {
                broken = Some((raw_tip, raw_tip));
            }
        }

        let (detected_at, walk_from) = match broken {
            Some(b) => b,
            None => return Ok(None),
        };

        let reconverged_at = frontier::find_reconvergence(
            self.source(),
            &*self.store,
            walk_from,
            self.opts.start_height,
        )?;
        warn!(
            "Reorg detected at {}H, reconverged at {:?}",
            detected_at, reconverged_at
        );

        self.store.set_checkpoint(checkpoint.min(reconverged_at))?;

        let tip = self.source().fetch_tip_height()?;
        if tip < max {
            let removed = self.store.rollback_from(tip + 1)?;
            warn!(
                "Chain shrank to {}H; removed {} height(s) above it",
                tip, removed
            );
            self.tips.reset(tip);
        }
        self.queue_refetch(reconverged_at, Some(max.min(tip)));

        Ok(Some(ReorgEvent {
            detected_at,
            reconverged_at,
        }))
    }

    /// Fetch and commit `worklist` on the worker pool
    ///
    /// Returns the fatal error that stopped dispatching, if any; in-flight
    /// heights are always drained first.
    ///
    /// The checkpoint is saved every time it moves.
    fn sync(
        &self,
        worklist: &[BlockHeight],
        tip: BlockHeight,
        stored_checkpoint: Option<BlockHeight>,
        tracker: &mut CheckpointTracker,
        report: &mut PassReport,
    ) -> Option<DriverError> {
        let workers = self.opts.workers.min(worklist.len()).max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<BlockHeight>();
        let (res_tx, res_rx) = crossbeam_channel::unbounded::<(BlockHeight, HeightResult)>();

        let fetcher = &self.fetcher;
        let writer = &self.writer;

        std::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                s.spawn(move || {
                    for height in job_rx.iter() {
                        let res = fetcher
                            .fetch(height)
                            .map_err(HeightFailure::from)
                            .and_then(|block| writer.commit(&block).map_err(HeightFailure::from));
                        if res_tx.send((height, res)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);

            let mut queue: VecDeque<BlockHeight> = worklist.iter().copied().collect();
            let mut attempts: HashMap<BlockHeight, u32> = HashMap::new();
            let mut in_flight = 0;
            let mut fatal = None;
            let mut persisted = stored_checkpoint;

            loop {
                while in_flight < workers && fatal.is_none() {
                    if self.shutdown.is_triggered() {
                        report.cancelled = true;
                        break;
                    }
                    let height = match queue.pop_front() {
                        Some(height) => height,
                        None => break,
                    };
                    if report.not_yet_mined.map_or(false, |nym| height >= nym) {
                        continue;
                    }
                    if job_tx.send(height).is_err() {
                        break;
                    }
                    in_flight += 1;
                }
                if in_flight == 0 {
                    break;
                }

                let (height, res) = match res_rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                in_flight -= 1;

                match res {
                    Ok(ack) => {
                        tracker.complete(height);
                        report.committed += 1;
                        match ack.change {
                            Change::Unchanged => report.unchanged += 1,
                            Change::Replaced => report.replaced += 1,
                            Change::Inserted | Change::Updated => {}
                        }
                        if height % 1000 == 0 || height + NEAR_TIP >= tip {
                            info!("Block {}H: {}", height, ack.hash);
                        }

                        let checkpoint = tracker.checkpoint();
                        if checkpoint != persisted {
                            match self.store.set_checkpoint(checkpoint) {
                                Ok(()) => persisted = checkpoint,
                                Err(e) => warn!("Failed to persist checkpoint: {}", e),
                            }
                        }
                    }
                    Err(HeightFailure::Fetch(e)) if e.is_fatal() => {
                        error!("Stopping: {}", e);
                        fatal = Some(match e {
                            FetchError::Rpc { source, .. } => DriverError::Rpc(source),
                            FetchError::Inconsistent { detail, .. } => {
                                DriverError::Rpc(RpcError::Permanent(detail))
                            }
                        });
                    }
                    Err(HeightFailure::Fetch(e)) if e.is_not_yet_mined() => {
                        debug!("{}H not mined yet", height);
                        report.not_yet_mined =
                            Some(report.not_yet_mined.map_or(height, |nym| nym.min(height)));
                    }
                    Err(e) => {
                        let n = attempts.entry(height).or_insert(0);
                        *n += 1;
                        if *n < self.opts.height_max_attempts {
                            debug!("{}H failed (attempt {}): {}; re-queued", height, n, e);
                            queue.push_back(height);
                        } else {
                            error!("{}H stalled after {} attempts: {}", height, n, e);
                            if let Err(se) = self.store.mark_stalled(height, *n, &e.to_string()) {
                                warn!("Failed to record stalled {}H: {}", height, se);
                            }
                            report.stalled.push(height);
                        }
                    }
                }
            }
            drop(job_tx);
            report.stalled.sort_unstable();
            fatal
        })
    }
}
