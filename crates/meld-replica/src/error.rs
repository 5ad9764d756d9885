use std::time::Duration;

use meld_store::StoreError;

/// Why a sync run stopped early.
///
/// None of these leave local state inconsistent: whatever was applied
/// before the failure is kept and the peer cursor reflects it.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The peer could not be reached or answered with an error.
    #[error("peer transport failed: {0}")]
    Transport(String),
    /// The peer's response envelope could not be decoded.
    #[error("malformed sync response: {0}")]
    Decode(String),
    /// The local store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The whole run exceeded its deadline.
    #[error("sync run timed out after {0:?}")]
    Timeout(Duration),
    /// A background worker panicked or was cancelled.
    #[error("sync worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
