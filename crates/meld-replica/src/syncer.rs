//! Pull-based anti-entropy against one peer at a time.
//!
//! A run probes the peer's version, compares it with the cursor stored for
//! that peer in the local time vector, pulls every change after the cursor
//! and applies it locally in chunks. The cursor moves to the newest applied
//! change after every chunk, so a run that fails partway keeps its progress.
//!
//! Runs for different peers are independent. Two runs for the same peer
//! would race on its cursor row, so callers serialize them (one
//! [`spawn_sync_task`](crate::spawn_sync_task) per peer does).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use meld::Timestamp;
use meld_store::{StorageFacade, StoreError, TimeVector};
use tracing::{debug, info, warn};

use crate::replica::Change;
use crate::transport::SyncTransport;
use crate::SyncError;

/// Changes pulled off the network before they are applied as one batch.
const APPLY_CHUNK: usize = 256;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The peer had nothing after our cursor.
    UpToDate,
    /// Changes were pulled and applied.
    Pulled,
}

/// Summary of one successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub status: SyncStatus,
    /// Changes submitted to the local facade.
    pub applied: usize,
    /// Changes the peer logged but had no item for.
    pub skipped: usize,
    /// The peer's cursor after the run.
    pub cursor: Timestamp,
}

/// Pulls changes from peers into a facade and tracks per-peer cursors.
///
/// `F` receives the pulled items: usually the node's
/// [`Updater`](crate::Updater), so that new remote writes are logged
/// and propagate onward. `V` holds the cursors.
pub struct Syncer<F: ?Sized, V: ?Sized> {
    facade: Arc<F>,
    vector: Arc<V>,
}

impl<F: ?Sized, V: ?Sized> Clone for Syncer<F, V> {
    fn clone(&self) -> Self {
        Self {
            facade: Arc::clone(&self.facade),
            vector: Arc::clone(&self.vector),
        }
    }
}

#[derive(Default)]
struct Applied {
    applied: usize,
    skipped: usize,
    max: Timestamp,
    error: Option<StoreError>,
}

impl<F: ?Sized, V: ?Sized> Syncer<F, V> {
    pub fn new(facade: Arc<F>, vector: Arc<V>) -> Self {
        Self { facade, vector }
    }
}

impl<F, V> Syncer<F, V>
where
    F: StorageFacade + ?Sized + 'static,
    V: TimeVector + ?Sized,
{
    /// The stored cursor for `peer_id`, [`Timestamp::ZERO`] if none.
    pub fn cursor(&self, peer_id: &str) -> Result<Timestamp, StoreError> {
        Ok(self
            .vector
            .query_watermark(peer_id)?
            .unwrap_or(Timestamp::ZERO))
    }

    /// Run one sync against `peer_id`.
    pub async fn sync_with<T>(&self, peer_id: &str, transport: &T) -> Result<SyncReport, SyncError>
    where
        T: SyncTransport + ?Sized,
    {
        let cursor = self.cursor(peer_id)?;
        let remote = transport.version().await?.unwrap_or(Timestamp::ZERO);
        if remote <= cursor {
            debug!(peer = peer_id, %cursor, %remote, "peer up to date");
            return Ok(SyncReport {
                status: SyncStatus::UpToDate,
                applied: 0,
                skipped: 0,
                cursor,
            });
        }

        let mut changes = transport.changes_since(cursor).await?;
        let mut total = Applied::default();
        let mut advanced = cursor;
        let mut chunk = Vec::with_capacity(APPLY_CHUNK);
        let mut stream_error = None;
        loop {
            let done = match changes.next().await {
                Some(Ok(change)) => {
                    chunk.push(change);
                    false
                }
                Some(Err(e)) => {
                    stream_error = Some(e);
                    true
                }
                None => true,
            };
            let full = chunk.len() >= APPLY_CHUNK || (done && !chunk.is_empty());
            if !full {
                if done {
                    break;
                }
                continue;
            }

            // No batch is open while the stream is polled, so a stalled peer
            // never holds a store transaction.
            let pending = std::mem::replace(&mut chunk, Vec::with_capacity(APPLY_CHUNK));
            let facade = Arc::clone(&self.facade);
            let outcome =
                tokio::task::spawn_blocking(move || apply_chunk(&*facade, pending)).await?;
            total.applied += outcome.applied;
            total.skipped += outcome.skipped;
            if outcome.max > advanced {
                self.vector.update_watermark(peer_id, outcome.max)?;
                advanced = outcome.max;
                debug!(peer = peer_id, from = %cursor, to = %advanced, "cursor advanced");
            }
            if let Some(e) = outcome.error {
                warn!(peer = peer_id, error = %e, applied = total.applied, "apply failed");
                return Err(e.into());
            }
            if done {
                break;
            }
        }
        drop(changes);

        if let Some(e) = stream_error {
            warn!(peer = peer_id, error = %e, applied = total.applied, "change stream failed");
            return Err(e);
        }

        info!(
            peer = peer_id,
            applied = total.applied,
            skipped = total.skipped,
            cursor = %advanced,
            "pulled changes"
        );
        Ok(SyncReport {
            status: SyncStatus::Pulled,
            applied: total.applied,
            skipped: total.skipped,
            cursor: advanced,
        })
    }

    /// [`sync_with`](Self::sync_with) bounded by `timeout`.
    ///
    /// On timeout the run is abandoned; changes already committed stay.
    pub async fn sync_with_timeout<T>(
        &self,
        peer_id: &str,
        transport: &T,
        timeout: Duration,
    ) -> Result<SyncReport, SyncError>
    where
        T: SyncTransport + ?Sized,
    {
        tokio::time::timeout(timeout, self.sync_with(peer_id, transport))
            .await
            .map_err(|_| SyncError::Timeout(timeout))?
    }
}

/// Apply one chunk of pulled changes in arrival order, inside a single
/// batch when the facade has one. Stops at the first failed submit.
fn apply_chunk<F: StorageFacade + ?Sized>(facade: &F, chunk: Vec<Change>) -> Applied {
    let mut out = Applied::default();
    let mut batch = match facade.start_batch() {
        Ok(batch) => batch,
        Err(e) => {
            out.error = Some(e);
            return out;
        }
    };

    for change in chunk {
        if change.found {
            let submitted = match batch.as_mut() {
                Some(batch) => batch.submit(&change.key, &change.item),
                None => facade.absorb(&change.key, &change.item),
            };
            if let Err(e) = submitted {
                out.error = Some(e);
                break;
            }
            out.applied += 1;
        } else {
            out.skipped += 1;
        }
        out.max = out.max.max(change.timestamp);
    }

    if let Some(batch) = batch {
        if let Err(e) = batch.finish() {
            // Nothing in the batch landed.
            out.applied = 0;
            out.max = Timestamp::ZERO;
            out.error.get_or_insert(e);
        } else {
            debug!(applied = out.applied, "batch committed");
        }
    }
    out
}
