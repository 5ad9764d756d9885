//! # meld-replica
//!
//! Turns a [`ReplicaStore`](meld_store::ReplicaStore) into a replicated
//! node: local writes are stamped and logged by the [`Updater`], peers pull
//! the log through a [`SyncTransport`], and a [`Syncer`] applies what it
//! pulled and remembers how far it got per peer.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use meld::{LwwItem, MergePolicy, Timestamp};
//! use meld_replica::{LocalPeer, Replica, SyncStatus};
//! use meld_store::{MemoryStore, StorageFacade};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let open = |id: &str| {
//!     let store = Arc::new(MemoryStore::new(MergePolicy::LastWriteWins));
//!     Replica::open(id, store, MergePolicy::LastWriteWins).unwrap()
//! };
//! let (a, b) = (open("a"), open("b"));
//!
//! let item = LwwItem::write(Timestamp::now(), b"on".to_vec()).encode();
//! b.updater().submit(b"lamp", &item).unwrap();
//!
//! let report = a.syncer().sync_with("b", &LocalPeer::new(b)).await.unwrap();
//! assert_eq!(report.status, SyncStatus::Pulled);
//! assert_eq!(a.store().obtain(b"lamp").unwrap(), Some(item));
//! # }
//! ```

mod error;
pub mod locks;
mod replica;
mod syncer;
mod task;
mod transport;
mod updater;

pub use error::SyncError;
pub use locks::KeyLocks;
pub use replica::{Change, ChangeFeed, Replica};
pub use syncer::{SyncReport, SyncStatus, Syncer};
pub use task::{spawn_sync_task, SyncTaskConfig};
pub use transport::{ChangeStream, LocalPeer, SyncTransport};
pub use updater::Updater;
