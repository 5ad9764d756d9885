//! # meld
//!
//! Merge policies for eventually-consistent, multi-master key-value
//! replication.
//!
//! Every write in a replicated database is an *item*: an opaque byte string
//! that is both the operation and the resulting record. Replicas exchange
//! items in any order and any number of times, and resolve them with a
//! [`Merger`] that is commutative and idempotent, so replicas that have seen
//! the same writes hold byte-identical items.
//!
//! ## Quick Start
//!
//! ```
//! use meld::{LwwItem, MergePolicy, Timestamp};
//!
//! let a = LwwItem::write(Timestamp::from_nanos(1), b"x".to_vec()).encode();
//! let b = LwwItem::write(Timestamp::from_nanos(2), b"y".to_vec()).encode();
//!
//! let pool = MergePolicy::LastWriteWins.pool();
//! assert_eq!(pool.merge_pair(&a, &b).item, pool.merge_pair(&b, &a).item);
//! ```
//!
//! ## Policies
//!
//! - [`LastWriteWins`] - whole-item last-write-wins with tombstones
//! - [`TableMerger`] - field-level last-write-wins with a row floor
//!
//! ## Clocks
//!
//! [`LogicalClock`] issues the strictly increasing [`Timestamp`]s that
//! writers stamp items and update-log entries with.

#![warn(missing_docs)]

pub mod clock;
mod error;
mod lww;
mod merger;
mod policy;
pub mod table;
mod timestamp;

pub use clock::LogicalClock;
pub use error::ItemError;
pub use lww::{LastWriteWins, LwwItem};
pub use merger::{MergePool, Merged, Merger, MergerFactory};
pub use policy::{MergePolicy, UnknownPolicy};
pub use table::{Field, TableMerger, TableRow};
pub use timestamp::Timestamp;
