//! Multi-field rows merged field by field.
//!
//! Each field carries its own write time and is resolved with
//! last-write-wins independently of the others. The row carries a *floor*:
//! fields written before the floor are gone. Deleting a row therefore needs
//! no per-field tombstones, only an empty row with a fresh floor.
//!
//! # Example
//!
//! ```
//! use meld::{MergePolicy, TableRow, Timestamp};
//!
//! let t = Timestamp::from_nanos;
//! let first = TableRow::put([("name", b"ada".to_vec()), ("lang", b"en".to_vec())], t(1));
//! let second = TableRow::put([("lang", b"fr".to_vec())], t(2));
//!
//! let pool = MergePolicy::Table.pool();
//! let merged = pool.merge_pair(&first.to_item(), &second.to_item());
//! let row = TableRow::from_item(&merged.item).unwrap();
//!
//! assert_eq!(row.get("name"), Some(b"ada".as_slice()));
//! assert_eq!(row.get("lang"), Some(b"fr".as_slice()));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ItemError, Merger, Timestamp};

/// One column value and the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// When this field was last written.
    pub timestamp: Timestamp,
    /// Raw column value.
    pub value: Vec<u8>,
}

/// A row item for [`TableMerger`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    /// Fields older than this are dropped on merge.
    pub floor: Timestamp,
    /// Sorted by name so equal rows encode to equal bytes.
    pub fields: BTreeMap<String, Field>,
}

impl TableRow {
    /// A partial update writing `fields` at `at`.
    ///
    /// The floor stays at zero so fields not named here survive the merge.
    pub fn put<K, I>(fields: I, at: Timestamp) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<u8>)>,
    {
        let fields = fields
            .into_iter()
            .map(|(name, value)| {
                (
                    name.into(),
                    Field {
                        timestamp: at,
                        value,
                    },
                )
            })
            .collect();
        Self {
            floor: Timestamp::ZERO,
            fields,
        }
    }

    /// A row delete at `at`: no fields, floor raised to `at`.
    pub fn delete(at: Timestamp) -> Self {
        Self {
            floor: at,
            fields: BTreeMap::new(),
        }
    }

    /// Current value of one field.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(|field| field.value.as_slice())
    }

    /// Live field values in name order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields
            .iter()
            .map(|(name, field)| (name.as_str(), field.value.as_slice()))
    }

    /// A row with no live fields reads as deleted.
    pub fn is_deleted(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize into an item.
    pub fn to_item(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Parse an item produced by [`to_item`](Self::to_item).
    pub fn from_item(item: &[u8]) -> Result<Self, ItemError> {
        Ok(postcard::from_bytes(item)?)
    }

    /// Drop fields below the floor. Returns whether any were dropped.
    fn trim(&mut self) -> bool {
        let before = self.fields.len();
        let floor = self.floor;
        self.fields.retain(|_, field| field.timestamp >= floor);
        self.fields.len() != before
    }

    /// Fold `other` into `self`. Returns whether `self` changed.
    fn absorb(&mut self, other: TableRow) -> bool {
        let mut changed = false;
        if other.floor > self.floor {
            self.floor = other.floor;
            self.trim();
            changed = true;
        }
        for (name, field) in other.fields {
            if field.timestamp < self.floor {
                continue;
            }
            match self.fields.get_mut(&name) {
                Some(held) if held.timestamp >= field.timestamp => {}
                Some(held) => {
                    *held = field;
                    changed = true;
                }
                None => {
                    self.fields.insert(name, field);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Field-level last-write-wins with a row floor.
///
/// The merged floor is the highest floor seen, and fields below it are
/// dropped. Equal field timestamps keep the value already held.
#[derive(Debug, Default)]
pub struct TableMerger {
    seed: Vec<u8>,
    row: Option<TableRow>,
    changed: bool,
}

impl TableMerger {
    /// Factory for [`MergePool`](crate::MergePool).
    pub fn factory() -> Box<dyn Merger + Send> {
        Box::<Self>::default()
    }
}

impl Merger for TableMerger {
    fn init(&mut self, item: &[u8]) {
        self.seed = item.to_vec();
        self.changed = false;
        self.row = match TableRow::from_item(item) {
            Ok(mut row) => {
                self.changed = row.trim();
                Some(row)
            }
            Err(_) => None,
        };
    }

    fn merge(&mut self, item: &[u8]) {
        let Ok(mut incoming) = TableRow::from_item(item) else {
            return;
        };
        match &mut self.row {
            Some(row) => {
                if row.absorb(incoming) {
                    self.changed = true;
                }
            }
            None => {
                incoming.trim();
                self.row = Some(incoming);
                self.changed = true;
            }
        }
    }

    fn changed(&self) -> bool {
        self.changed
    }

    fn result(&self) -> Vec<u8> {
        match (&self.row, self.changed) {
            (Some(row), true) => row.to_item(),
            _ => self.seed.clone(),
        }
    }

    fn cleanup(&mut self) {
        self.seed = Vec::new();
        self.row = None;
    }
}
