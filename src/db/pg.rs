//! Postgres block metadata store
//!
//! ## Data consistency
//!
//! All three records of a height are written in one transaction, together
//! with the `next_block_hash` back-patch of the height below, so readers never
//! see a partial height. Workers commit different heights concurrently;
//! transaction-scoped advisory locks on `{height-1, height}` (always taken in
//! ascending order) keep two commits touching the same header from
//! interleaving.
//!
//! Upserts only touch rows whose content actually differs
//! (`IS DISTINCT FROM`), which is how "identical payload" is told apart from
//! "replaced" without reading the old rows back.
use super::{BlockStore, Change, ChainLink, StalledHeight, StoreError, TableHeads};
use crate::{
    prelude::*,
    util::{display_chain, trace_time, RetryPolicy},
    BlockData,
};
use itertools::Itertools;
use std::{
    str::FromStr,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// shorter `postgres` crate import names to just `pg::X`
mod pg {
    pub use postgres::{types::ToSql, Client, GenericClient};
}

type BlockHeightSigned = i32;

/// Namespace for our advisory lock keys ("bm")
const ADVISORY_LOCK_NAMESPACE: i64 = 0x626d;

fn advisory_key(height: BlockHeight) -> i64 {
    (ADVISORY_LOCK_NAMESPACE << 32) | i64::from(height)
}

/// Establish connection with the DB, retrying with backoff
pub fn establish_connection(url: &str, retry: RetryPolicy) -> Result<pg::Client, StoreError> {
    // Basic URL diagnostics
    match url::Url::parse(url) {
        Ok(u) => {
            debug!(
                "PG connect target: host={:?} port={:?} db={} user={}",
                u.host_str(),
                u.port_or_known_default(),
                u.path().trim_start_matches('/'),
                u.username()
            );
        }
        Err(e) => {
            warn!("PG connect target: failed to parse URL: {}", e);
        }
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        match pg::Client::connect(url, postgres::tls::NoTls) {
            Ok(client) => return Ok(client),
            Err(e) if attempts < retry.max_attempts => {
                let delay = retry.delay(attempts);
                warn!(
                    "Error connecting to PG (attempt {}/{}): {}; retrying in {:?}",
                    attempts,
                    retry.max_attempts,
                    display_chain(&e),
                    delay
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(StoreError::Unavailable(display_chain(&e))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Conflict,
    Unavailable,
    Fatal,
}

/// Map a SQLSTATE (if the server sent one) to how we treat it
fn classify_sqlstate(code: Option<&str>) -> ErrorKind {
    match code {
        // serialization_failure, deadlock_detected
        Some("40001") | Some("40P01") => ErrorKind::Conflict,
        // connection exceptions, insufficient resources, operator intervention
        Some(c) if c.starts_with("08") || c.starts_with("53") || c.starts_with("57P") => {
            ErrorKind::Unavailable
        }
        Some(_) => ErrorKind::Fatal,
        // no server error at all: the socket went away
        None => ErrorKind::Unavailable,
    }
}

impl From<postgres::Error> for StoreError {
    fn from(e: postgres::Error) -> Self {
        let msg = match e.as_db_error() {
            Some(dbe) => format!(
                "{} (code: {}, detail: {:?}, hint: {:?})",
                dbe.message(),
                dbe.code().code(),
                dbe.detail(),
                dbe.hint()
            ),
            None => display_chain(&e),
        };
        match classify_sqlstate(e.code().map(|c| c.code())) {
            ErrorKind::Conflict => StoreError::Conflict(msg),
            ErrorKind::Unavailable => StoreError::Unavailable(msg),
            ErrorKind::Fatal => StoreError::Fatal(msg),
        }
    }
}

fn execute_with_log(
    conn: &mut impl pg::GenericClient,
    sql: &str,
    params: &[&(dyn pg::ToSql + Sync)],
    context: &str,
) -> Result<u64, StoreError> {
    match conn.execute(sql, params) {
        Ok(n) => Ok(n),
        Err(e) => {
            if let Some(dbe) = e.as_db_error() {
                error!(
                    "Postgres {} error: {} (code: {:?}, detail: {:?}, hint: {:?}); sql: {}",
                    context,
                    dbe.message(),
                    dbe.code(),
                    dbe.detail(),
                    dbe.hint(),
                    sql
                );
            } else {
                error!("Postgres {} error: {}; sql: {}", context, e, sql);
            }
            Err(e.into())
        }
    }
}

fn query_one_value_opt<T>(
    conn: &mut impl pg::GenericClient,
    q: &str,
    params: &[&(dyn pg::ToSql + Sync)],
) -> Result<Option<T>, StoreError>
where
    T: for<'a> postgres::types::FromSql<'a>,
{
    Ok(conn
        .query_opt(q, params)?
        .and_then(|row| row.get::<_, Option<T>>(0)))
}

fn query_two_values<T1, T2>(
    conn: &mut impl pg::GenericClient,
    q: &str,
    params: &[&(dyn pg::ToSql + Sync)],
) -> Result<Option<(T1, T2)>, StoreError>
where
    T1: for<'a> postgres::types::FromSql<'a>,
    T2: for<'b> postgres::types::FromSql<'b>,
{
    Ok(conn
        .query_opt(q, params)?
        .map(|row| (row.get::<_, T1>(0), row.get::<_, T2>(1))))
}

fn parse_hash(s: &str) -> Result<BlockHash, StoreError> {
    BlockHash::from_str(s).map_err(|e| StoreError::Fatal(format!("stored hash {:?}: {}", s, e)))
}

fn to_height(h: BlockHeightSigned) -> BlockHeight {
    h as BlockHeight
}

fn unix_to_system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

/// `INSERT .. ON CONFLICT (block_height) DO UPDATE` that leaves identical rows alone
///
/// `columns` excludes `block_height`, which is always `$1`.
fn upsert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = (1..=columns.len() + 1).map(|i| format!("${}", i)).join(", ");
    let updates = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}", c = c))
        .join(", ");
    let current = columns.iter().map(|c| format!("{}.{}", table, c)).join(", ");
    let excluded = columns.iter().map(|c| format!("EXCLUDED.{}", c)).join(", ");

    format!(
        "INSERT INTO {table} (block_height, {columns}) VALUES ({placeholders}) \
         ON CONFLICT (block_height) DO UPDATE SET {updates} \
         WHERE ({current}) IS DISTINCT FROM ({excluded})",
        table = table,
        columns = columns.join(", "),
        placeholders = placeholders,
        updates = updates,
        current = current,
        excluded = excluded,
    )
}

const HEADER_COLUMNS: &[&str] = &[
    "block_hash",
    "confirmations",
    "version",
    "version_hex",
    "merkle_root",
    "block_time",
    "median_time",
    "nonce",
    "bits",
    "difficulty",
    "chainwork",
    "n_tx",
    "previous_block_hash",
    "next_block_hash",
];

const STATS_COLUMNS: &[&str] = &[
    "block_hash",
    "total_fee",
    "avg_fee",
    "avg_fee_rate",
    "avg_tx_size",
    "txs",
    "block_time",
    "block_timestamp",
    "median_time",
    "ins",
    "outs",
    "min_fee",
    "max_fee",
    "median_fee",
    "min_fee_rate",
    "max_fee_rate",
    "min_tx_size",
    "max_tx_size",
    "median_tx_size",
    "segwit_txs",
    "segwit_total_size",
    "segwit_total_weight",
    "total_out",
    "total_size",
    "total_weight",
    "subsidy",
    "utxo_increase",
    "utxo_size_increase",
    "utxo_increase_actual",
    "utxo_size_increase_actual",
];

struct UpsertSql {
    hashes: String,
    headers: String,
    stats: String,
}

impl UpsertSql {
    fn new() -> Self {
        Self {
            hashes: upsert_sql("block_hashes", &["block_hash"]),
            headers: upsert_sql("block_headers", HEADER_COLUMNS),
            stats: upsert_sql("block_stats", STATS_COLUMNS),
        }
    }
}

/// Fixed-size set of connections shared by the workers
///
/// A connection found closed on checkout is replaced.
pub struct Pool {
    url: String,
    retry: RetryPolicy,
    /// `None` is a slot whose connection needs (re)establishing
    idle: Mutex<Vec<Option<pg::Client>>>,
    returned: Condvar,
}

impl Pool {
    pub fn new(url: String, size: usize, retry: RetryPolicy) -> Result<Self, StoreError> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size.max(1) {
            idle.push(Some(establish_connection(&url, retry)?));
        }
        Ok(Self {
            url,
            retry,
            idle: Mutex::new(idle),
            returned: Condvar::new(),
        })
    }

    fn checkout(&self) -> Result<pg::Client, StoreError> {
        let slot = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(slot) = idle.pop() {
                    break slot;
                }
                idle = self
                    .returned
                    .wait(idle)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        match slot {
            Some(client) if !client.is_closed() => Ok(client),
            _ => {
                debug!("Replacing closed PG connection");
                establish_connection(&self.url, self.retry).map_err(|e| {
                    self.checkin(None);
                    e
                })
            }
        }
    }

    fn checkin(&self, client: Option<pg::Client>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client.filter(|c| !c.is_closed()));
        self.returned.notify_one();
    }

    pub fn with_client<T>(
        &self,
        f: impl FnOnce(&mut pg::Client) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut client = self.checkout()?;
        let res = f(&mut client);
        self.checkin(Some(client));
        res
    }
}

pub struct PgStore {
    pool: Pool,
    sql: UpsertSql,
}

impl PgStore {
    /// Connect, and create the schema if it's not there
    pub fn new(url: String, pool_size: usize) -> Result<Self> {
        let retry = RetryPolicy::new(8, Duration::from_millis(250), Duration::from_secs(30));
        let pool = Pool::new(url, pool_size, retry)?;
        pool.with_client(Self::init)?;
        info!("Connected to PG with {} connection(s)", pool_size.max(1));

        Ok(Self {
            pool,
            sql: UpsertSql::new(),
        })
    }

    fn init(conn: &mut pg::Client) -> Result<(), StoreError> {
        debug!("Ensuring db schema");
        conn.batch_execute(include_str!("pg/init.sql"))
            .map_err(|e| {
                error!("Postgres init error: {}", display_chain(&e));
                e
            })?;
        Ok(())
    }

    pub fn wipe(url: &str) -> Result<()> {
        info!("Wiping db schema");
        let mut connection = establish_connection(url, RetryPolicy::immediate(1))?;
        connection.batch_execute(include_str!("pg/wipe.sql"))?;
        Ok(())
    }

    fn commit_in(
        &self,
        conn: &mut pg::Client,
        block: &BlockData,
    ) -> Result<Change, StoreError> {
        let mut tx = conn.transaction()?;
        let height = block.height as BlockHeightSigned;
        let header = &block.data.header;
        let stats = &block.data.stats;

        for lock_height in block.height.checked_sub(1).into_iter().chain(Some(block.height)) {
            execute_with_log(
                &mut tx,
                "SELECT pg_advisory_xact_lock($1)",
                &[&advisory_key(lock_height)],
                "advisory lock",
            )?;
        }

        let hash = block.id.to_string();
        let existing: Option<String> = query_one_value_opt(
            &mut tx,
            "SELECT block_hash FROM block_hashes WHERE block_height = $1",
            &[&height],
        )?;
        let above: Option<(String, Option<String>)> = query_two_values(
            &mut tx,
            "SELECT block_hash, previous_block_hash FROM block_headers WHERE block_height = $1",
            &[&(height + 1)],
        )?;

        let next_block_hash = match above {
            Some((above_hash, Some(above_prev))) if above_prev == hash => Some(above_hash),
            _ => header.next_block_hash.map(|h| h.to_string()),
        };
        let previous_block_hash = header.previous_block_hash.map(|h| h.to_string());

        let mut changed = execute_with_log(
            &mut tx,
            &self.sql.hashes,
            &[&height, &hash],
            "block_hashes upsert",
        )?;
        changed += execute_with_log(
            &mut tx,
            &self.sql.headers,
            &[
                &height,
                &hash,
                &header.confirmations,
                &header.version,
                &header.version_hex,
                &header.merkle_root,
                &header.time,
                &header.median_time,
                &header.nonce,
                &header.bits,
                &header.difficulty,
                &header.chainwork,
                &header.n_tx,
                &previous_block_hash,
                &next_block_hash,
            ],
            "block_headers upsert",
        )?;
        let block_timestamp = unix_to_system_time(stats.time);
        changed += execute_with_log(
            &mut tx,
            &self.sql.stats,
            &[
                &height,
                &hash,
                &stats.total_fee,
                &stats.avg_fee,
                &stats.avg_fee_rate,
                &stats.avg_tx_size,
                &stats.txs,
                &stats.time,
                &block_timestamp,
                &stats.median_time,
                &stats.ins,
                &stats.outs,
                &stats.min_fee,
                &stats.max_fee,
                &stats.median_fee,
                &stats.min_fee_rate,
                &stats.max_fee_rate,
                &stats.min_tx_size,
                &stats.max_tx_size,
                &stats.median_tx_size,
                &stats.segwit_txs,
                &stats.segwit_total_size,
                &stats.segwit_total_weight,
                &stats.total_out,
                &stats.total_size,
                &stats.total_weight,
                &stats.subsidy,
                &stats.utxo_increase,
                &stats.utxo_size_increase,
                &stats.utxo_increase_actual,
                &stats.utxo_size_increase_actual,
            ],
            "block_stats upsert",
        )?;

        if let Some(previous) = &previous_block_hash {
            execute_with_log(
                &mut tx,
                "UPDATE block_headers SET next_block_hash = $1 \
                 WHERE block_height = $2 AND block_hash = $3 \
                 AND next_block_hash IS DISTINCT FROM $1",
                &[&hash, &(height - 1), previous],
                "next_block_hash back-patch",
            )?;
        }
        execute_with_log(
            &mut tx,
            "DELETE FROM stalled_heights WHERE block_height = $1",
            &[&height],
            "stalled_heights clear",
        )?;

        tx.commit()?;

        Ok(match existing {
            None => Change::Inserted,
            Some(old) if old != hash => Change::Replaced,
            Some(_) if changed == 0 => Change::Unchanged,
            Some(_) => Change::Updated,
        })
    }
}

impl BlockStore for PgStore {
    fn commit(&self, block: &BlockData) -> Result<Change, StoreError> {
        self.pool.with_client(|conn| self.commit_in(conn, block))
    }

    fn checkpoint(&self) -> Result<Option<BlockHeight>, StoreError> {
        self.pool.with_client(|conn| {
            Ok(query_one_value_opt::<BlockHeightSigned>(
                conn,
                "SELECT checkpoint FROM sync_state",
                &[],
            )?
            .map(to_height))
        })
    }

    fn set_checkpoint(&self, height: Option<BlockHeight>) -> Result<(), StoreError> {
        let height = height.map(|h| h as BlockHeightSigned);
        self.pool.with_client(|conn| {
            execute_with_log(
                conn,
                "INSERT INTO sync_state (id, checkpoint, updated_at) VALUES (TRUE, $1, now()) \
                 ON CONFLICT (id) DO UPDATE SET checkpoint = EXCLUDED.checkpoint, updated_at = now()",
                &[&height],
                "checkpoint update",
            )?;
            Ok(())
        })
    }

    fn max_committed_height(&self) -> Result<Option<BlockHeight>, StoreError> {
        self.pool.with_client(|conn| {
            Ok(query_one_value_opt::<BlockHeightSigned>(
                conn,
                "SELECT max(block_height) FROM block_hashes",
                &[],
            )?
            .map(to_height))
        })
    }

    fn hash_at(&self, height: BlockHeight) -> Result<Option<BlockHash>, StoreError> {
        self.pool.with_client(|conn| {
            query_one_value_opt::<String>(
                conn,
                "SELECT block_hash FROM block_hashes WHERE block_height = $1",
                &[&(height as BlockHeightSigned)],
            )?
            .map(|s| parse_hash(&s))
            .transpose()
        })
    }

    fn chain_links(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<ChainLink>, StoreError> {
        self.pool.with_client(|conn| {
            trace_time(
                || {
                    conn.query(
                        "SELECT block_height, block_hash, previous_block_hash FROM block_headers \
                         WHERE block_height BETWEEN $1 AND $2 ORDER BY block_height",
                        &[&(from as BlockHeightSigned), &(to as BlockHeightSigned)],
                    )?
                    .iter()
                    .map(|row| {
                        Ok(ChainLink {
                            height: to_height(row.get(0)),
                            hash: parse_hash(row.get(1))?,
                            previous_block_hash: row
                                .get::<_, Option<&str>>(2)
                                .map(parse_hash)
                                .transpose()?,
                        })
                    })
                    .collect::<Result<Vec<_>, StoreError>>()
                },
                |duration, links| {
                    trace!(
                        "Loaded {} chain links in {}ms",
                        links.len(),
                        duration.as_millis()
                    )
                },
            )
        })
    }

    fn missing_heights(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<BlockHeight>, StoreError> {
        if to < from {
            return Ok(vec![]);
        }
        self.pool.with_client(|conn| {
            Ok(conn
                .query(
                    "SELECT h FROM generate_series($1::integer, $2::integer) AS h \
                     WHERE NOT EXISTS (SELECT 1 FROM block_hashes WHERE block_height = h) \
                     OR NOT EXISTS (SELECT 1 FROM block_headers WHERE block_height = h) \
                     OR NOT EXISTS (SELECT 1 FROM block_stats WHERE block_height = h) \
                     ORDER BY h",
                    &[&(from as BlockHeightSigned), &(to as BlockHeightSigned)],
                )?
                .iter()
                .map(|row| to_height(row.get(0)))
                .collect())
        })
    }

    fn rollback_from(&self, height: BlockHeight) -> Result<u64, StoreError> {
        let height = height as BlockHeightSigned;
        self.pool.with_client(|conn| {
            let mut tx = conn.transaction()?;
            let removed = execute_with_log(
                &mut tx,
                "DELETE FROM block_hashes WHERE block_height >= $1",
                &[&height],
                "rollback",
            )?;
            for table in ["block_headers", "block_stats"] {
                execute_with_log(
                    &mut tx,
                    &format!("DELETE FROM {} WHERE block_height >= $1", table),
                    &[&height],
                    "rollback",
                )?;
            }
            execute_with_log(
                &mut tx,
                "UPDATE block_headers SET next_block_hash = NULL WHERE block_height = $1",
                &[&(height - 1)],
                "rollback",
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }

    fn mark_stalled(
        &self,
        height: BlockHeight,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let attempts = i32::try_from(attempts).unwrap_or(i32::MAX);
        self.pool.with_client(|conn| {
            execute_with_log(
                conn,
                "INSERT INTO stalled_heights (block_height, attempts, last_error, stalled_at) \
                 VALUES ($1, $2, $3, now()) ON CONFLICT (block_height) DO UPDATE SET \
                 attempts = stalled_heights.attempts + EXCLUDED.attempts, \
                 last_error = EXCLUDED.last_error, stalled_at = now()",
                &[&(height as BlockHeightSigned), &attempts, &last_error],
                "stalled_heights upsert",
            )?;
            Ok(())
        })
    }

    fn stalled_heights(&self) -> Result<Vec<StalledHeight>, StoreError> {
        self.pool.with_client(|conn| {
            Ok(conn
                .query(
                    "SELECT block_height, attempts, last_error FROM stalled_heights \
                     ORDER BY block_height",
                    &[],
                )?
                .iter()
                .map(|row| StalledHeight {
                    height: to_height(row.get(0)),
                    attempts: row.get::<_, i32>(1).max(0) as u32,
                    last_error: row.get(2),
                })
                .collect())
        })
    }

    fn table_heads(&self) -> Result<TableHeads, StoreError> {
        self.pool.with_client(|conn| {
            let row = conn.query_one(
                "SELECT (SELECT max(block_height) FROM block_hashes), \
                 (SELECT max(block_height) FROM block_headers), \
                 (SELECT max(block_height) FROM block_stats)",
                &[],
            )?;
            let head = |i: usize| row.get::<_, Option<BlockHeightSigned>>(i).map(to_height);
            Ok(TableHeads {
                hashes: head(0),
                headers: head(1),
                stats: head(2),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{fetcher::Fetcher, mock::MockChain};
    use std::sync::Arc;

    #[test]
    fn upsert_skips_identical_rows() {
        assert_eq!(
            upsert_sql("block_hashes", &["block_hash"]),
            "INSERT INTO block_hashes (block_height, block_hash) VALUES ($1, $2) \
             ON CONFLICT (block_height) DO UPDATE SET block_hash = EXCLUDED.block_hash \
             WHERE (block_hashes.block_hash) IS DISTINCT FROM (EXCLUDED.block_hash)"
        );
        let sql = UpsertSql::new();
        assert!(sql.headers.contains("$15)"));
        assert!(sql.stats.contains("$31)"));
    }

    #[test]
    fn sqlstate_classes() {
        assert_eq!(classify_sqlstate(Some("40001")), ErrorKind::Conflict);
        assert_eq!(classify_sqlstate(Some("40P01")), ErrorKind::Conflict);
        assert_eq!(classify_sqlstate(Some("08006")), ErrorKind::Unavailable);
        assert_eq!(classify_sqlstate(Some("53300")), ErrorKind::Unavailable);
        assert_eq!(classify_sqlstate(Some("57P01")), ErrorKind::Unavailable);
        assert_eq!(classify_sqlstate(Some("23505")), ErrorKind::Fatal);
        assert_eq!(classify_sqlstate(None), ErrorKind::Unavailable);
    }

    #[test]
    fn lock_keys_are_namespaced_per_height() {
        assert_ne!(advisory_key(1), advisory_key(2));
        assert_eq!(advisory_key(0) >> 32, ADVISORY_LOCK_NAMESPACE);
        assert_eq!(advisory_key(u32::MAX) & 0xffff_ffff, i64::from(u32::MAX));
    }

    /// Needs a scratch database: `TEST_DATABASE_URL=postgres://...`
    #[test]
    fn round_trip_against_postgres() {
        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        PgStore::wipe(&url).unwrap();
        let store = PgStore::new(url, 2).unwrap();
        let chain = Arc::new(MockChain::new(5));
        let fetcher = Fetcher::new(chain.clone());

        for h in [0, 1, 3, 2] {
            let mut block = fetcher.fetch(h).unwrap();
            block.data.header.next_block_hash = None;
            assert_eq!(store.commit(&block).unwrap(), Change::Inserted);
        }
        let mut again = fetcher.fetch(2).unwrap();
        again.data.header.next_block_hash = Some(chain.hash(3));
        assert_eq!(store.commit(&again).unwrap(), Change::Unchanged);

        let links = store.chain_links(0, 3).unwrap();
        assert_eq!(links.len(), 4);
        assert_eq!(links[3].previous_block_hash, Some(chain.hash(2)));
        assert_eq!(store.hash_at(1).unwrap(), Some(chain.hash(1)));
        assert_eq!(store.missing_heights(0, 5).unwrap(), vec![4, 5]);

        store.mark_stalled(4, 3, "stats: boom").unwrap();
        assert_eq!(store.stalled_heights().unwrap()[0].height, 4);
        store.commit(&fetcher.fetch(4).unwrap()).unwrap();
        assert!(store.stalled_heights().unwrap().is_empty());

        store.set_checkpoint(Some(4)).unwrap();
        assert_eq!(store.checkpoint().unwrap(), Some(4));

        chain.fork(3, 5, 1);
        assert_eq!(
            store.commit(&fetcher.fetch(3).unwrap()).unwrap(),
            Change::Replaced
        );
        assert_eq!(store.rollback_from(4).unwrap(), 1);
        assert_eq!(store.max_committed_height().unwrap(), Some(3));
        assert_eq!(store.table_heads().unwrap().stats, Some(3));
    }
}
