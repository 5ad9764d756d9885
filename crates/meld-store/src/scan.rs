//! Background producer for update-log scans.
//!
//! A scan returns immediately. A producer thread walks the backend and feeds
//! records through a bounded channel, so a slow consumer applies
//! backpressure and a dropped consumer stops the producer at its next send.

use std::sync::mpsc::{self, Receiver, SyncSender};

use meld::Timestamp;
use tracing::warn;

use crate::{StoreError, UpdateRecord};

/// Records buffered between producer and consumer.
pub const SCAN_BUFFER: usize = 1024;

/// Producer side of a [`LogScan`].
pub struct ScanSink {
    tx: SyncSender<Result<UpdateRecord, StoreError>>,
}

impl ScanSink {
    /// Hand one record to the consumer. Returns `false` once the consumer is
    /// gone.
    pub fn send(&self, record: UpdateRecord) -> bool {
        self.tx.send(Ok(record)).is_ok()
    }
}

/// Keyset position of a paged scan: everything strictly after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub timestamp: Timestamp,
    /// `None` before the first page: skip all of `timestamp`.
    pub key: Option<Vec<u8>>,
}

/// A lazy, cancellable stream of update records.
pub struct LogScan {
    rx: Receiver<Result<UpdateRecord, StoreError>>,
}

impl LogScan {
    /// Run `produce` on a new thread and stream what it sends.
    ///
    /// An `Err` returned by `produce` is delivered as the last element.
    pub fn spawn<F>(produce: F) -> Self
    where
        F: FnOnce(&ScanSink) -> Result<(), StoreError> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(SCAN_BUFFER);
        let spawned = std::thread::Builder::new()
            .name("meld-log-scan".into())
            .spawn(move || {
                let sink = ScanSink { tx };
                if let Err(e) = produce(&sink) {
                    warn!(error = %e, "update log scan failed");
                    let _ = sink.tx.send(Err(e));
                }
            });
        match spawned {
            Ok(_) => Self { rx },
            Err(e) => Self::failed(StoreError::Backend(format!("spawn scan producer: {e}"))),
        }
    }

    /// Scan in pages fetched by `fetch(cursor, limit)`.
    ///
    /// `fetch` must return up to `limit` records strictly after `cursor` in
    /// `(timestamp, key)` order. No backend lock needs to be held between
    /// pages.
    pub fn paged<F>(since: Timestamp, page: usize, mut fetch: F) -> Self
    where
        F: FnMut(&ScanCursor, usize) -> Result<Vec<UpdateRecord>, StoreError> + Send + 'static,
    {
        Self::spawn(move |sink| {
            let mut cursor = ScanCursor {
                timestamp: since,
                key: None,
            };
            loop {
                let records = fetch(&cursor, page)?;
                let full = records.len() >= page;
                let Some(last) = records.last() else {
                    return Ok(());
                };
                cursor = ScanCursor {
                    timestamp: last.timestamp,
                    key: Some(last.key.clone()),
                };
                for record in records {
                    if !sink.send(record) {
                        return Ok(());
                    }
                }
                if !full {
                    return Ok(());
                }
            }
        })
    }

    /// A scan that yields `error` and ends.
    pub fn failed(error: StoreError) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = tx.send(Err(error));
        Self { rx }
    }
}

impl Iterator for LogScan {
    type Item = Result<UpdateRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl std::fmt::Debug for LogScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogScan").finish_non_exhaustive()
    }
}
