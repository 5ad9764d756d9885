use serde::{Deserialize, Serialize};

use crate::{ItemError, Merger, Timestamp};

/// A last-write-wins item.
///
/// Carries the write time, a presence flag and the payload. A tombstone
/// (`present == false`) records a delete; it takes part in merges like any
/// other write and is superseded by a later one.
///
/// # Example
///
/// ```
/// use meld::{LwwItem, MergePolicy, Timestamp};
///
/// let old = LwwItem::write(Timestamp::from_nanos(1), b"x".to_vec()).encode();
/// let new = LwwItem::write(Timestamp::from_nanos(2), b"y".to_vec()).encode();
///
/// let pool = MergePolicy::LastWriteWins.pool();
/// let merged = pool.merge_pair(&old, &new);
/// let winner = LwwItem::decode(&merged.item).unwrap();
/// assert_eq!(winner.value(), Some(b"y".as_slice()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwItem {
    /// When the write happened.
    pub timestamp: Timestamp,
    /// `false` for a tombstone.
    pub present: bool,
    /// The written value. Empty for tombstones.
    pub payload: Vec<u8>,
}

impl LwwItem {
    /// A write of `payload` at `at`.
    pub fn write(at: Timestamp, payload: Vec<u8>) -> Self {
        Self {
            timestamp: at,
            present: true,
            payload,
        }
    }

    /// A delete at `at`.
    pub fn tombstone(at: Timestamp) -> Self {
        Self {
            timestamp: at,
            present: false,
            payload: Vec::new(),
        }
    }

    /// Serialize into an item.
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Parse an item produced by [`encode`](Self::encode).
    pub fn decode(item: &[u8]) -> Result<Self, ItemError> {
        Ok(postcard::from_bytes(item)?)
    }

    /// The live value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        self.present.then_some(self.payload.as_slice())
    }
}

/// Keeps the item with the latest embedded timestamp.
///
/// On equal timestamps the item already held wins. Only the timestamp is
/// inspected; the winning item's bytes are passed through untouched.
#[derive(Debug, Default)]
pub struct LastWriteWins {
    changed: bool,
    updated: Timestamp,
    item: Vec<u8>,
}

impl LastWriteWins {
    /// Factory for [`MergePool`](crate::MergePool).
    pub fn factory() -> Box<dyn Merger + Send> {
        Box::<Self>::default()
    }
}

impl Merger for LastWriteWins {
    fn init(&mut self, item: &[u8]) {
        self.changed = false;
        self.item = item.to_vec();
        // An unreadable seed loses against any readable item.
        self.updated = LwwItem::decode(item)
            .map(|lww| lww.timestamp)
            .unwrap_or(Timestamp::ZERO);
    }

    fn merge(&mut self, item: &[u8]) {
        let Ok(lww) = LwwItem::decode(item) else {
            return;
        };
        if self.updated < lww.timestamp {
            self.updated = lww.timestamp;
            self.item = item.to_vec();
            self.changed = true;
        }
    }

    fn changed(&self) -> bool {
        self.changed
    }

    fn result(&self) -> Vec<u8> {
        self.item.clone()
    }

    fn cleanup(&mut self) {
        self.item = Vec::new();
    }
}
