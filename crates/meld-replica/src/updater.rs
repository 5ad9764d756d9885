//! Local write path: stamp, log, then store.
//!
//! Every write accepted by a node gets a timestamp from the node's
//! [`LogicalClock`], is recorded in the update log under that timestamp, and
//! only then reaches the storage facade. Peers discover the write by reading
//! the log, so a write is never visible in the store without a log entry.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use meld::{LogicalClock, MergePolicy, MergePool, Timestamp};
use meld_store::{ReplicaStore, StorageFacade, StoreError};
use tracing::trace;

use crate::locks::KeyLocks;

struct ClockState {
    clock: LogicalClock,
    /// Highest clock value written to this node's time vector row.
    persisted: Timestamp,
    /// Stamps whose write has not reached the store yet.
    in_flight: BTreeSet<Timestamp>,
}

/// Assigns timestamps to local writes and keeps the update log.
///
/// The clock state is resumed from the node's own time vector row, so a
/// restarted node never reissues a timestamp.
///
/// `Updater` is itself a [`StorageFacade`]: submits through it are logged
/// writes, and [`absorb`](StorageFacade::absorb) applies replicated writes
/// without logging those that change nothing.
pub struct Updater<S: ?Sized> {
    node_id: String,
    pool: MergePool,
    state: Mutex<ClockState>,
    locks: KeyLocks,
    store: Arc<S>,
}

/// Removes its stamp from the in-flight set on drop.
struct InFlight<'a> {
    state: &'a Mutex<ClockState>,
    at: Timestamp,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight.remove(&self.at);
        }
    }
}

impl<S: ReplicaStore + ?Sized> Updater<S> {
    /// Open the tracker for `node_id` over `store`, driven by the system
    /// clock.
    pub fn open(node_id: impl Into<String>, store: Arc<S>, policy: MergePolicy) -> Result<Self, StoreError> {
        Self::with_clock(node_id, store, policy, LogicalClock::new())
    }

    /// Like [`open`](Self::open) with a caller-supplied clock.
    pub fn with_clock(
        node_id: impl Into<String>,
        store: Arc<S>,
        policy: MergePolicy,
        clock: LogicalClock,
    ) -> Result<Self, StoreError> {
        let node_id = node_id.into();
        let persisted = store.query_watermark(&node_id)?.unwrap_or(Timestamp::ZERO);
        Ok(Self {
            node_id,
            pool: policy.pool(),
            state: Mutex::new(ClockState {
                clock: clock.resume(persisted),
                persisted,
                in_flight: BTreeSet::new(),
            }),
            locks: KeyLocks::new(),
            store,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Accept a local write and return the timestamp it was logged under.
    pub fn write(&self, key: &[u8], item: &[u8]) -> Result<Timestamp, StoreError> {
        let stamp = {
            let _key = self.locks.lock(key);
            let existing = self.store.query_update(key)?;
            let stamp = self.stamp()?;
            let logged = existing.map_or(stamp.at, |prev| prev.max(stamp.at));
            self.store.record_update(key, logged)?;
            stamp
        };
        self.persist_clock()?;
        self.store.submit(key, item)?;
        trace!(node = %self.node_id, at = %stamp.at, "write logged");
        Ok(stamp.at)
    }

    /// The highest timestamp below which every issued stamp has finished
    /// writing.
    ///
    /// Log records at or below it have their items in the store.
    pub fn stable_watermark(&self) -> Result<Timestamp, StoreError> {
        let state = self.lock_state()?;
        Ok(match state.in_flight.first() {
            Some(oldest) => oldest.prev(),
            None => state.clock.last(),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ClockState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn stamp(&self) -> Result<InFlight<'_>, StoreError> {
        let mut state = self.lock_state()?;
        let at = state.clock.advance();
        state.in_flight.insert(at);
        Ok(InFlight {
            state: &self.state,
            at,
        })
    }

    /// Write the clock to this node's time vector row if it moved.
    fn persist_clock(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        let last = state.clock.last();
        if last > state.persisted {
            self.store.update_watermark(&self.node_id, last)?;
            state.persisted = last;
        }
        Ok(())
    }
}

impl<S: ReplicaStore + ?Sized> StorageFacade for Updater<S> {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        self.write(key, item).map(|_| ())
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.obtain(key)
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        self.store.stream(visit)
    }

    fn absorb(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        if let Some(held) = self.store.obtain(key)? {
            if !self.pool.merge_pair(&held, item).changed {
                return Ok(());
            }
        }
        self.write(key, item).map(|_| ())
    }
}

impl<S: ?Sized> std::fmt::Debug for Updater<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
