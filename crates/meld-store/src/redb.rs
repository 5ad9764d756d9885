//! Pure-Rust backend using [`redb`](https://docs.rs/redb).
//!
//! No C dependencies. Every operation runs in its own redb transaction;
//! [`StorageFacade::start_batch`] groups many submits into one.
//!
//! Enable with `features = ["redb"]`.
//!
//! ```no_run
//! use meld::MergePolicy;
//! use meld_store::{RedbStore, TimeVector};
//!
//! let store = RedbStore::open("/tmp/meld.redb", MergePolicy::LastWriteWins).unwrap();
//! println!("{:?}", store.watermarks().unwrap());
//! ```

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use meld::{MergePolicy, MergePool, Timestamp};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::traits::{
    FacadeBatch, StorageFacade, StoreError, TimeVector, UpdateLog, UpdateRecord,
};
use crate::LogScan;

// ── Table definitions ───────────────────────────────────────────────

const ITEMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("items");
/// key -> logged time
const UPDATE_LOG: TableDefinition<&[u8], u64> = TableDefinition::new("update_log");
/// `time_be(8) ++ key` -> empty, ordered by time then key
const UPDATE_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("update_index");
const TIME_VECTOR: TableDefinition<&str, u64> = TableDefinition::new("time_vector");

fn err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

// ── Store ───────────────────────────────────────────────────────────

/// A replica store on a single redb file.
pub struct RedbStore {
    db: Arc<Database>,
    pool: MergePool,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, policy: MergePolicy) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(err)?;
        Self::init(db, policy)
    }

    /// Create an in-memory redb database (for testing).
    pub fn open_in_memory(policy: MergePolicy) -> Result<Self, StoreError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(err)?;
        Self::init(db, policy)
    }

    fn init(db: Database, policy: MergePolicy) -> Result<Self, StoreError> {
        // Ensure tables exist so readers never see a missing table.
        let txn = db.begin_write().map_err(err)?;
        txn.open_table(ITEMS).map_err(err)?;
        txn.open_table(UPDATE_LOG).map_err(err)?;
        txn.open_table(UPDATE_INDEX).map_err(err)?;
        txn.open_table(TIME_VECTOR).map_err(err)?;
        txn.commit().map_err(err)?;
        Ok(Self {
            db: Arc::new(db),
            pool: policy.pool(),
        })
    }
}

/// Merge `item` into `key` inside an open write transaction.
fn apply(txn: &WriteTransaction, pool: &MergePool, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
    let mut table = txn.open_table(ITEMS).map_err(err)?;
    let held = table.get(key).map_err(err)?.map(|guard| guard.value().to_vec());
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
    table.insert(key, next.as_slice()).map_err(err)?;
    Ok(())
}

fn index_key(at: Timestamp, key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(8 + key.len());
    k.extend_from_slice(&at.to_be_bytes());
    k.extend_from_slice(key);
    k
}

// ── StorageFacade ───────────────────────────────────────────────────

impl StorageFacade for RedbStore {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(err)?;
        apply(&txn, &self.pool, key, item)?;
        txn.commit().map_err(err)?;
        Ok(())
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(ITEMS).map_err(err)?;
        match table.get(key).map_err(err)? {
            Some(guard) => Ok(Some(guard.value().to_vec())),
            None => Ok(None),
        }
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        // Read transactions are snapshots and never block writers.
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(ITEMS).map_err(err)?;
        for entry in table.iter().map_err(err)? {
            let (key, item) = entry.map_err(err)?;
            if visit(key.value(), item.value()).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn start_batch(&self) -> Result<Option<Box<dyn FacadeBatch + '_>>, StoreError> {
        let txn = self.db.begin_write().map_err(err)?;
        Ok(Some(Box::new(RedbBatch {
            txn,
            pool: &self.pool,
        })))
    }
}

/// One write transaction shared by many submits.
struct RedbBatch<'a> {
    txn: WriteTransaction,
    pool: &'a MergePool,
}

impl FacadeBatch for RedbBatch<'_> {
    fn submit(&mut self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        apply(&self.txn, self.pool, key, item)
    }

    fn finish(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit().map_err(err)
    }
}

// ── UpdateLog ───────────────────────────────────────────────────────

impl UpdateLog for RedbStore {
    fn query_update(&self, key: &[u8]) -> Result<Option<Timestamp>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(UPDATE_LOG).map_err(err)?;
        let logged = table.get(key).map_err(err)?;
        Ok(logged.map(|guard| Timestamp::from_nanos(guard.value())))
    }

    fn record_update(&self, key: &[u8], at: Timestamp) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(err)?;
        {
            let mut log = txn.open_table(UPDATE_LOG).map_err(err)?;
            let mut index = txn.open_table(UPDATE_INDEX).map_err(err)?;
            let old = log
                .insert(key, at.as_nanos())
                .map_err(err)?
                .map(|guard| Timestamp::from_nanos(guard.value()));
            if let Some(old) = old {
                index.remove(index_key(old, key).as_slice()).map_err(err)?;
            }
            index
                .insert(index_key(at, key).as_slice(), b"".as_slice())
                .map_err(err)?;
        }
        txn.commit().map_err(err)?;
        Ok(())
    }

    fn read_all_since(&self, since: Timestamp) -> LogScan {
        let db = Arc::clone(&self.db);
        LogScan::spawn(move |sink| {
            let txn = db.begin_read().map_err(err)?;
            let index = txn.open_table(UPDATE_INDEX).map_err(err)?;
            let start = since.to_be_bytes();
            for entry in index.range(start.as_slice()..).map_err(err)? {
                let (raw, _) = entry.map_err(err)?;
                let raw = raw.value();
                let Some(timestamp) = Timestamp::from_be_slice(raw) else {
                    continue;
                };
                if timestamp <= since {
                    continue;
                }
                let record = UpdateRecord {
                    key: raw[8..].to_vec(),
                    timestamp,
                };
                if !sink.send(record) {
                    break;
                }
            }
            Ok(())
        })
    }
}

// ── TimeVector ──────────────────────────────────────────────────────

impl TimeVector for RedbStore {
    fn query_watermark(&self, peer: &str) -> Result<Option<Timestamp>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(TIME_VECTOR).map_err(err)?;
        let row = table.get(peer).map_err(err)?;
        Ok(row.map(|guard| Timestamp::from_nanos(guard.value())))
    }

    fn update_watermark(&self, peer: &str, at: Timestamp) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(err)?;
        {
            let mut table = txn.open_table(TIME_VECTOR).map_err(err)?;
            table.insert(peer, at.as_nanos()).map_err(err)?;
        }
        txn.commit().map_err(err)?;
        Ok(())
    }

    fn watermarks(&self) -> Result<Vec<(String, Timestamp)>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(TIME_VECTOR).map_err(err)?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(err)? {
            let (peer, at) = entry.map_err(err)?;
            rows.push((peer.value().to_string(), Timestamp::from_nanos(at.value())));
        }
        Ok(rows)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use meld::LwwItem;

    fn new_store() -> RedbStore {
        RedbStore::open_in_memory(MergePolicy::LastWriteWins).unwrap()
    }

    fn lww(ts: u64, value: &str) -> Vec<u8> {
        LwwItem::write(Timestamp::from_nanos(ts), value.as_bytes().to_vec()).encode()
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    #[test]
    fn submit_obtain_merges() {
        let store = new_store();
        store.submit(b"k1", &lww(5, "hello")).unwrap();
        store.submit(b"k1", &lww(3, "stale")).unwrap();
        assert_eq!(store.obtain(b"k1").unwrap(), Some(lww(5, "hello")));
        assert_eq!(store.obtain(b"k2").unwrap(), None);
    }

    #[test]
    fn stream_in_key_order() {
        let store = new_store();
        for key in ["b", "a", "c"] {
            store.submit(key.as_bytes(), &lww(1, key)).unwrap();
        }
        let mut keys = Vec::new();
        store
            .stream(&mut |key, _| {
                keys.push(String::from_utf8_lossy(key).into_owned());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn batch_commits_on_finish() {
        let store = new_store();
        let mut batch = store.start_batch().unwrap().unwrap();
        batch.submit(b"a", &lww(1, "x")).unwrap();
        batch.submit(b"a", &lww(2, "y")).unwrap();
        batch.submit(b"b", &lww(1, "z")).unwrap();
        batch.finish().unwrap();

        assert_eq!(store.obtain(b"a").unwrap(), Some(lww(2, "y")));
        assert_eq!(store.obtain(b"b").unwrap(), Some(lww(1, "z")));
    }

    #[test]
    fn dropped_batch_rolls_back() {
        let store = new_store();
        {
            let mut batch = store.start_batch().unwrap().unwrap();
            batch.submit(b"a", &lww(1, "x")).unwrap();
        }
        assert_eq!(store.obtain(b"a").unwrap(), None);
    }

    #[test]
    fn update_log_moves_index_entry() {
        let store = new_store();
        store.record_update(b"k", ts(4)).unwrap();
        store.record_update(b"j", ts(4)).unwrap();
        store.record_update(b"k", ts(9)).unwrap();
        assert_eq!(store.query_update(b"k").unwrap(), Some(ts(9)));
        assert_eq!(store.query_update(b"x").unwrap(), None);

        let records: Vec<_> = store
            .read_all_since(Timestamp::ZERO)
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            records,
            vec![
                UpdateRecord { key: b"j".to_vec(), timestamp: ts(4) },
                UpdateRecord { key: b"k".to_vec(), timestamp: ts(9) },
            ]
        );

        let later: Vec<_> = store.read_all_since(ts(4)).map(Result::unwrap).collect();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].key, b"k");
    }

    #[test]
    fn time_vector_rows() {
        let store = new_store();
        store.update_watermark("self", ts(10)).unwrap();
        store.update_watermark("peer-b", ts(3)).unwrap();
        store.update_watermark("self", ts(11)).unwrap();
        assert_eq!(store.query_watermark("self").unwrap(), Some(ts(11)));
        assert_eq!(store.query_watermark("nobody").unwrap(), None);
        assert_eq!(
            store.watermarks().unwrap(),
            vec![("peer-b".to_string(), ts(3)), ("self".to_string(), ts(11))]
        );
    }

    #[test]
    fn open_file_based() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.redb");
        {
            let store = RedbStore::open(&path, MergePolicy::LastWriteWins).unwrap();
            store.submit(b"k", &lww(1, "persist")).unwrap();
            store.record_update(b"k", ts(1)).unwrap();
        }
        let store = RedbStore::open(&path, MergePolicy::LastWriteWins).unwrap();
        assert_eq!(store.obtain(b"k").unwrap(), Some(lww(1, "persist")));
        assert_eq!(store.query_update(b"k").unwrap(), Some(ts(1)));
    }
}
