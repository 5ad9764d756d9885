use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, ControlFlow};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use meld::{MergePolicy, MergePool, Timestamp};

use crate::scan::ScanCursor;
use crate::traits::{StorageFacade, StoreError, TimeVector, UpdateLog, UpdateRecord};
use crate::LogScan;

/// Keys copied per page while streaming items.
const STREAM_PAGE: usize = 256;
/// Records copied per page while scanning the log.
const SCAN_PAGE: usize = 512;

/// In-memory storage backend.
///
/// Items, the update log and the time vector live in `BTreeMap`s behind
/// locks; nothing touches disk. Meant for tests and single-process setups.
///
/// # Example
///
/// ```
/// use meld::{LwwItem, MergePolicy, Timestamp};
/// use meld_store::{MemoryStore, StorageFacade};
///
/// let store = MemoryStore::new(MergePolicy::LastWriteWins);
/// let item = LwwItem::write(Timestamp::from_nanos(1), b"22.5".to_vec()).encode();
/// store.submit(b"sensor-1", &item).unwrap();
///
/// assert_eq!(store.obtain(b"sensor-1").unwrap(), Some(item));
/// ```
pub struct MemoryStore {
    pool: MergePool,
    items: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    log: Arc<RwLock<LogIndex>>,
    peers: RwLock<BTreeMap<String, Timestamp>>,
}

#[derive(Default)]
struct LogIndex {
    by_key: BTreeMap<Vec<u8>, Timestamp>,
    by_time: BTreeSet<(Timestamp, Vec<u8>)>,
}

impl MemoryStore {
    /// Create an empty store resolving conflicts with `policy`.
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            pool: policy.pool(),
            items: RwLock::new(BTreeMap::new()),
            log: Arc::new(RwLock::new(LogIndex::default())),
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored items.
    pub fn item_count(&self) -> Result<usize, StoreError> {
        Ok(read(&self.items)?.len())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| StoreError::LockPoisoned)
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| StoreError::LockPoisoned)
}

impl StorageFacade for MemoryStore {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        let mut items = write(&self.items)?;
        match items.get_mut(key) {
            Some(held) => {
                let merged = self.pool.merge_pair(held, item);
                if merged.changed {
                    *held = merged.item;
                }
            }
            None => {
                items.insert(key.to_vec(), item.to_vec());
            }
        }
        Ok(())
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(read(&self.items)?.get(key).cloned())
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        let mut after: Option<Vec<u8>> = None;
        loop {
            // Copy a page so `visit` runs without the lock held.
            let page: Vec<(Vec<u8>, Vec<u8>)> = {
                let items = read(&self.items)?;
                let lower = match &after {
                    Some(key) => Bound::Excluded(key.as_slice()),
                    None => Bound::Unbounded,
                };
                items
                    .range::<[u8], _>((lower, Bound::Unbounded))
                    .take(STREAM_PAGE)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            };
            let full = page.len() == STREAM_PAGE;
            for (key, item) in &page {
                if visit(key.as_slice(), item.as_slice()).is_break() {
                    return Ok(());
                }
            }
            match (full, page.into_iter().last()) {
                (true, Some((key, _))) => after = Some(key),
                _ => return Ok(()),
            }
        }
    }
}

impl UpdateLog for MemoryStore {
    fn query_update(&self, key: &[u8]) -> Result<Option<Timestamp>, StoreError> {
        Ok(read(&self.log)?.by_key.get(key).copied())
    }

    fn record_update(&self, key: &[u8], at: Timestamp) -> Result<(), StoreError> {
        let mut log = write(&self.log)?;
        if let Some(old) = log.by_key.insert(key.to_vec(), at) {
            log.by_time.remove(&(old, key.to_vec()));
        }
        log.by_time.insert((at, key.to_vec()));
        Ok(())
    }

    fn read_all_since(&self, since: Timestamp) -> LogScan {
        let log = Arc::clone(&self.log);
        LogScan::paged(since, SCAN_PAGE, move |cursor: &ScanCursor, limit| {
            let log = log.read().map_err(|_| StoreError::LockPoisoned)?;
            let lower = match &cursor.key {
                Some(key) => Bound::Excluded((cursor.timestamp, key.clone())),
                None => Bound::Included((cursor.timestamp, Vec::new())),
            };
            Ok(log
                .by_time
                .range((lower, Bound::Unbounded))
                .skip_while(|(ts, _)| cursor.key.is_none() && *ts <= cursor.timestamp)
                .take(limit)
                .map(|(ts, key)| UpdateRecord {
                    key: key.clone(),
                    timestamp: *ts,
                })
                .collect())
        })
    }
}

impl TimeVector for MemoryStore {
    fn query_watermark(&self, peer: &str) -> Result<Option<Timestamp>, StoreError> {
        Ok(read(&self.peers)?.get(peer).copied())
    }

    fn update_watermark(&self, peer: &str, at: Timestamp) -> Result<(), StoreError> {
        write(&self.peers)?.insert(peer.to_string(), at);
        Ok(())
    }

    fn watermarks(&self) -> Result<Vec<(String, Timestamp)>, StoreError> {
        Ok(read(&self.peers)?
            .iter()
            .map(|(peer, ts)| (peer.clone(), *ts))
            .collect())
    }
}
