//! SQLite backend using rusqlite.
//!
//! Uses WAL mode by default so readers on other connections are not blocked
//! by a writer. Scans and item streams page through the tables with keyset
//! queries and release the connection between pages.
//!
//! # Example
//!
//! ```no_run
//! use meld::MergePolicy;
//! use meld_store::{SqliteStore, StorageFacade};
//!
//! let store = SqliteStore::open("node.db", MergePolicy::Table).unwrap();
//! let item = store.obtain(b"user:1").unwrap();
//! ```

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use meld::{MergePolicy, MergePool, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};

use crate::scan::ScanCursor;
use crate::traits::{
    FacadeBatch, StorageFacade, StoreError, TimeVector, UpdateLog, UpdateRecord,
};
use crate::LogScan;

const STREAM_PAGE: i64 = 256;
const SCAN_PAGE: usize = 512;

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
    /// SQLite page size. Defaults to 4096.
    pub page_size: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            page_size: 4096,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-ahead logging: readers proceed during writes.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// A replica store in one SQLite database.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex`; the schema is created
/// on open.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    pool: MergePool,
}

impl SqliteStore {
    /// Open (or create) a database at the given path with default config.
    pub fn open<P: AsRef<Path>>(path: P, policy: MergePolicy) -> Result<Self, StoreError> {
        Self::open_with_config(path, policy, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        policy: MergePolicy,
        config: SqliteConfig,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        Ok(Self::wrap(conn, policy))
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory(policy: MergePolicy) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, &SqliteConfig::default())?;
        Self::create_schema(&conn)?;
        Ok(Self::wrap(conn, policy))
    }

    fn wrap(conn: Connection, policy: MergePolicy) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            pool: policy.pool(),
        }
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), StoreError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA page_size = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
            config.page_size,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_items (
                k       BLOB PRIMARY KEY,
                item    BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS update_log (
                u_key   BLOB PRIMARY KEY,
                u_time  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_update_log_time
                ON update_log(u_time, u_key);

            CREATE TABLE IF NOT EXISTS time_vector (
                v_node  TEXT PRIMARY KEY,
                v_time  INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Get the current journal mode.
    pub fn journal_mode(&self) -> Result<String, StoreError> {
        let conn = self.lock()?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }
}

/// SQLite integers are signed; timestamps past `i64::MAX` clamp.
fn to_sql(at: Timestamp) -> i64 {
    i64::try_from(at.as_nanos()).unwrap_or(i64::MAX)
}

fn from_sql(raw: i64) -> Timestamp {
    Timestamp::from_nanos(u64::try_from(raw).unwrap_or(0))
}

/// Merge `item` into `key` on `conn`. The caller owns the transaction.
fn apply(conn: &Connection, pool: &MergePool, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
    let held: Option<Vec<u8>> = conn
        .query_row("SELECT item FROM kv_items WHERE k = ?1", params![key], |row| row.get(0))
        .optional()?;
    let next = match held {
        Some(held) => {
            let merged = pool.merge_pair(&held, item);
            if !merged.changed {
                return Ok(());
            }
            merged.item
        }
        None => item.to_vec(),
    };
    conn.execute(
        "INSERT INTO kv_items (k, item) VALUES (?1, ?2)
         ON CONFLICT(k) DO UPDATE SET item = excluded.item",
        params![key, next],
    )?;
    Ok(())
}

impl StorageFacade for SqliteStore {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        apply(&tx, &self.pool, key, item)?;
        tx.commit()?;
        Ok(())
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        let item = conn
            .query_row("SELECT item FROM kv_items WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(item)
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        let mut after: Vec<u8> = Vec::new();
        let mut first = true;
        loop {
            let page: Vec<(Vec<u8>, Vec<u8>)> = {
                let conn = self.lock()?;
                let mut stmt = conn.prepare_cached(
                    "SELECT k, item FROM kv_items WHERE ?1 OR k > ?2 ORDER BY k LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![first, after, STREAM_PAGE], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>, _>>()?;
                rows
            };
            first = false;
            for (key, item) in &page {
                if visit(key.as_slice(), item.as_slice()).is_break() {
                    return Ok(());
                }
            }
            if (page.len() as i64) < STREAM_PAGE {
                return Ok(());
            }
            if let Some((key, _)) = page.into_iter().last() {
                after = key;
            }
        }
    }

    fn start_batch(&self) -> Result<Option<Box<dyn FacadeBatch + '_>>, StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Some(Box::new(SqliteBatch {
            conn,
            pool: &self.pool,
            open: true,
        })))
    }
}

/// An explicit transaction holding the connection until it ends.
struct SqliteBatch<'a> {
    conn: MutexGuard<'a, Connection>,
    pool: &'a MergePool,
    open: bool,
}

impl FacadeBatch for SqliteBatch<'_> {
    fn submit(&mut self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        apply(&self.conn, self.pool, key, item)
    }

    fn finish(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteBatch<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl UpdateLog for SqliteStore {
    fn query_update(&self, key: &[u8]) -> Result<Option<Timestamp>, StoreError> {
        let conn = self.lock()?;
        let raw: Option<i64> = conn
            .query_row("SELECT u_time FROM update_log WHERE u_key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(from_sql))
    }

    fn record_update(&self, key: &[u8], at: Timestamp) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO update_log (u_key, u_time) VALUES (?1, ?2)
             ON CONFLICT(u_key) DO UPDATE SET u_time = excluded.u_time",
            params![key, to_sql(at)],
        )?;
        Ok(())
    }

    fn read_all_since(&self, since: Timestamp) -> LogScan {
        let conn = Arc::clone(&self.conn);
        LogScan::paged(since, SCAN_PAGE, move |cursor: &ScanCursor, limit| {
            let conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let time = to_sql(cursor.timestamp);
            let records = match &cursor.key {
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT u_key, u_time FROM update_log
                         WHERE u_time > ?1 ORDER BY u_time, u_key LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![time, limit], record_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                Some(key) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT u_key, u_time FROM update_log
                         WHERE u_time > ?1 OR (u_time = ?1 AND u_key > ?2)
                         ORDER BY u_time, u_key LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![time, key, limit], record_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(records)
        })
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpdateRecord> {
    Ok(UpdateRecord {
        key: row.get(0)?,
        timestamp: from_sql(row.get(1)?),
    })
}

impl TimeVector for SqliteStore {
    fn query_watermark(&self, peer: &str) -> Result<Option<Timestamp>, StoreError> {
        let conn = self.lock()?;
        let raw: Option<i64> = conn
            .query_row("SELECT v_time FROM time_vector WHERE v_node = ?1", params![peer], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(from_sql))
    }

    fn update_watermark(&self, peer: &str, at: Timestamp) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO time_vector (v_node, v_time) VALUES (?1, ?2)
             ON CONFLICT(v_node) DO UPDATE SET v_time = excluded.v_time",
            params![peer, to_sql(at)],
        )?;
        Ok(())
    }

    fn watermarks(&self) -> Result<Vec<(String, Timestamp)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT v_node, v_time FROM time_vector ORDER BY v_node")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, from_sql(row.get(1)?))))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
