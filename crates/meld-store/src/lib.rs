//! # meld-store
//!
//! Storage for a meld replica: the key-item store the merge policies write
//! through, the per-key update log, and the per-peer time vector.
//!
//! Every backend implements all three contracts and so is a
//! [`ReplicaStore`] that one node can run on.
//!
//! ## Quick Start
//!
//! ```
//! use meld::{LwwItem, MergePolicy, Timestamp};
//! use meld_store::{MemoryStore, StorageFacade, UpdateLog};
//!
//! let store = MemoryStore::new(MergePolicy::LastWriteWins);
//! let at = Timestamp::from_nanos(7);
//! store.submit(b"k", &LwwItem::write(at, b"v".to_vec()).encode()).unwrap();
//! store.record_update(b"k", at).unwrap();
//!
//! let changed: Vec<_> = store.read_all_since(Timestamp::ZERO).collect();
//! assert_eq!(changed.len(), 1);
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Batches | Use case |
//! |---------|-------------|---------|----------|
//! | [`MemoryStore`] | *(always available)* | no | Testing, prototyping |
//! | `RedbStore` | `redb` | yes | Pure-Rust nodes without C deps |
//! | `SqliteStore` | `sqlite` | yes | Nodes that want SQL inspection |

mod memory;
#[cfg(feature = "redb")]
mod redb;
pub mod scan;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use memory::MemoryStore;
#[cfg(feature = "redb")]
pub use redb::RedbStore;
pub use scan::LogScan;
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteStore};
pub use traits::*;
