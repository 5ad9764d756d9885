use std::ops::ControlFlow;

use meld::Timestamp;

use crate::LogScan;

/// Errors returned by storage backends.
///
/// Every variant is a transient fault: the operation failed, the store is
/// not corrupted, and the caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A thread panicked while holding a store lock.
    #[error("storage lock poisoned")]
    LockPoisoned,
    /// An error from SQLite.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// The last known modification time of one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UpdateRecord {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

/// A key-item store that resolves conflicting writes itself.
///
/// Every write is merged with the item already held for the key, so
/// submitting the same item twice, or two items in either order, leaves the
/// same result. Implementations serialize concurrent submits for one key
/// internally.
pub trait StorageFacade: Send + Sync {
    /// Merge `item` into whatever is stored under `key`.
    ///
    /// A merge that changes nothing is still `Ok`. `Err` means a storage
    /// fault.
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError>;

    /// Read the item stored under `key`.
    ///
    /// `Ok(None)` means the key is absent; `Err` means the store could not
    /// be read and says nothing about the key.
    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Visit every stored `(key, item)` once, in key order.
    ///
    /// Keys present when the traversal starts are never skipped. The
    /// traversal is not a snapshot: concurrent writes may or may not be
    /// seen. Returning [`ControlFlow::Break`] from `visit` stops early.
    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError>;

    /// Open a batch that applies many submits in one transaction.
    ///
    /// Backends without transactions return `Ok(None)` and callers fall back
    /// to [`submit`](Self::submit).
    fn start_batch(&self) -> Result<Option<Box<dyn FacadeBatch + '_>>, StoreError> {
        Ok(None)
    }

    /// Apply a write replicated from another node.
    ///
    /// Stores treat it like any other submit; wrappers that track local
    /// history can tell the two apart.
    fn absorb(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        self.submit(key, item)
    }
}

/// An open write batch. Dropping it without [`finish`](Self::finish) rolls
/// back every submit made through it.
pub trait FacadeBatch {
    /// Merge `item` into `key` inside the batch.
    fn submit(&mut self, key: &[u8], item: &[u8]) -> Result<(), StoreError>;

    /// Commit the batch.
    fn finish(self: Box<Self>) -> Result<(), StoreError>;
}

/// Per-key log of the last modification time, queryable by time.
pub trait UpdateLog: Send + Sync {
    /// The logged time of `key`, if it was ever written.
    fn query_update(&self, key: &[u8]) -> Result<Option<Timestamp>, StoreError>;

    /// Set the logged time of `key`, replacing any previous entry.
    fn record_update(&self, key: &[u8], at: Timestamp) -> Result<(), StoreError>;

    /// Every record with a timestamp strictly after `since`.
    ///
    /// Returns at once; records are produced in the background in
    /// `(timestamp, key)` order. Dropping the scan stops the producer.
    fn read_all_since(&self, since: Timestamp) -> LogScan;
}

/// Per-peer sync watermarks.
///
/// Callers only ever move a peer's watermark forward. The store does not
/// check this.
pub trait TimeVector: Send + Sync {
    /// The watermark stored for `peer`.
    fn query_watermark(&self, peer: &str) -> Result<Option<Timestamp>, StoreError>;

    /// Insert or overwrite the watermark for `peer`.
    fn update_watermark(&self, peer: &str, at: Timestamp) -> Result<(), StoreError>;

    /// All stored rows, ordered by peer.
    fn watermarks(&self) -> Result<Vec<(String, Timestamp)>, StoreError>;
}

/// Everything one node keeps: items, update log and time vector.
pub trait ReplicaStore: StorageFacade + UpdateLog + TimeVector {}

impl<T: StorageFacade + UpdateLog + TimeVector + ?Sized> ReplicaStore for T {}
