//! A node handle and the responder side of the pull protocol.

use std::sync::Arc;

use futures::StreamExt;
use meld::{LogicalClock, MergePolicy, Timestamp};
use meld_store::{LogScan, ReplicaStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::syncer::Syncer;
use crate::transport::ChangeStream;
use crate::updater::Updater;
use crate::SyncError;

/// Changes buffered between the blocking reader and an async consumer.
const CHANGE_BUFFER: usize = 256;

/// One update-log record as served to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: Vec<u8>,
    /// When this node last logged a write to `key`.
    pub timestamp: Timestamp,
    /// `false` if the log has the key but the store does not.
    pub found: bool,
    /// The current item for `key`; empty when not `found`.
    pub item: Vec<u8>,
}

/// A replicated node: one store, its update tracker and its syncers.
///
/// Cloning is cheap and shares everything.
pub struct Replica<S: ?Sized> {
    updater: Arc<Updater<S>>,
    store: Arc<S>,
}

impl<S: ?Sized> Clone for Replica<S> {
    fn clone(&self) -> Self {
        Self {
            updater: Arc::clone(&self.updater),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ReplicaStore + ?Sized> Replica<S> {
    /// Open node `node_id` over `store`.
    pub fn open(
        node_id: impl Into<String>,
        store: Arc<S>,
        policy: MergePolicy,
    ) -> Result<Self, StoreError> {
        Self::with_clock(node_id, store, policy, LogicalClock::new())
    }

    /// Open with a caller-supplied clock.
    pub fn with_clock(
        node_id: impl Into<String>,
        store: Arc<S>,
        policy: MergePolicy,
        clock: LogicalClock,
    ) -> Result<Self, StoreError> {
        let updater = Updater::with_clock(node_id, Arc::clone(&store), policy, clock)?;
        Ok(Self {
            updater: Arc::new(updater),
            store,
        })
    }

    pub fn node_id(&self) -> &str {
        self.updater.node_id()
    }

    /// The write path. Local writes go through here, never straight to the
    /// store.
    pub fn updater(&self) -> &Arc<Updater<S>> {
        &self.updater
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// This node's own watermark: the last timestamp it issued.
    pub fn version(&self) -> Result<Option<Timestamp>, StoreError> {
        self.store.query_watermark(self.updater.node_id())
    }

    /// Log records after `since` joined with their current items.
    ///
    /// Records stamped after the updater's stable watermark are held back
    /// until their writes land.
    pub fn changes_since(&self, since: Timestamp) -> Result<ChangeFeed<S>, StoreError> {
        let bound = self.updater.stable_watermark()?;
        Ok(ChangeFeed {
            store: Arc::clone(&self.store),
            scan: self.store.read_all_since(since),
            bound,
            done: false,
        })
    }

    /// A syncer that applies pulled changes through this node's updater.
    pub fn syncer(&self) -> Syncer<Updater<S>, S> {
        Syncer::new(Arc::clone(&self.updater), Arc::clone(&self.store))
    }
}

impl<S: ReplicaStore + ?Sized + 'static> Replica<S> {
    /// [`changes_since`](Self::changes_since) as an async stream.
    ///
    /// The feed is read on the blocking pool. Must be called within a Tokio
    /// runtime.
    pub fn change_stream(&self, since: Timestamp) -> ChangeStream {
        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        let replica = self.clone();
        tokio::task::spawn_blocking(move || {
            let feed = match replica.changes_since(since) {
                Ok(feed) => feed,
                Err(e) => {
                    let _ = tx.blocking_send(Err(SyncError::from(e)));
                    return;
                }
            };
            for change in feed {
                if tx.blocking_send(change.map_err(SyncError::from)).is_err() {
                    return;
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

impl<S: ?Sized> std::fmt::Debug for Replica<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("updater", &self.updater)
            .finish_non_exhaustive()
    }
}

/// Blocking iterator returned by [`Replica::changes_since`].
///
/// Ends after the first error.
pub struct ChangeFeed<S: ?Sized> {
    store: Arc<S>,
    scan: LogScan,
    bound: Timestamp,
    done: bool,
}

impl<S: ReplicaStore + ?Sized> Iterator for ChangeFeed<S> {
    type Item = Result<Change, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let record = match self.scan.next()? {
            Ok(record) => record,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if record.timestamp > self.bound {
            self.done = true;
            return None;
        }
        match self.store.obtain(&record.key) {
            Ok(item) => Some(Ok(Change {
                found: item.is_some(),
                item: item.unwrap_or_default(),
                key: record.key,
                timestamp: record.timestamp,
            })),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
