//! Background task that syncs with one peer on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use meld_store::{StorageFacade, TimeVector};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::syncer::{SyncStatus, Syncer};
use crate::transport::SyncTransport;

/// Configuration for a periodic sync task.
#[derive(Debug, Clone)]
pub struct SyncTaskConfig {
    /// Time between the starts of two runs.
    pub interval: Duration,
    /// Deadline for a single run.
    pub timeout: Duration,
}

impl Default for SyncTaskConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Spawn a task pulling from `peer_id` every `config.interval`.
///
/// Runs never overlap: a slow run delays the next tick instead of stacking
/// up. Failures are logged and retried on the next tick. Abort the returned
/// handle to stop.
pub fn spawn_sync_task<F, V, T>(
    syncer: Syncer<F, V>,
    peer_id: String,
    transport: Arc<T>,
    config: SyncTaskConfig,
) -> JoinHandle<()>
where
    F: StorageFacade + ?Sized + 'static,
    V: TimeVector + ?Sized + 'static,
    T: SyncTransport + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut tick = interval(config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match syncer
                .sync_with_timeout(&peer_id, &*transport, config.timeout)
                .await
            {
                Ok(report) if report.status == SyncStatus::Pulled => {
                    debug!(peer = %peer_id, applied = report.applied, "sync run finished");
                }
                Ok(_) => {}
                Err(e) => warn!(peer = %peer_id, error = %e, "sync run failed"),
            }
        }
    })
}
