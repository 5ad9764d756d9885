use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{LastWriteWins, MergePool, MergerFactory, TableMerger};

/// Conflict-resolution policy of a database, fixed at configuration time.
///
/// Every replica of a database must use the same policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// [`LwwItem`](crate::LwwItem) items, resolved by [`LastWriteWins`].
    #[default]
    #[serde(alias = "lww")]
    LastWriteWins,
    /// [`TableRow`](crate::TableRow) items, resolved by [`TableMerger`].
    Table,
}

impl MergePolicy {
    /// The merger factory for this policy.
    pub fn factory(self) -> MergerFactory {
        match self {
            Self::LastWriteWins => LastWriteWins::factory,
            Self::Table => TableMerger::factory,
        }
    }

    /// A fresh merger pool for this policy.
    pub fn pool(self) -> MergePool {
        MergePool::new(self.factory())
    }

    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "lww",
            Self::Table => "table",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned for an unknown policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown merge policy `{0}` (expected `lww` or `table`)")]
pub struct UnknownPolicy(pub String);

impl FromStr for MergePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lww" | "last_write_wins" => Ok(Self::LastWriteWins),
            "table" => Ok(Self::Table),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("lww".parse::<MergePolicy>(), Ok(MergePolicy::LastWriteWins));
        assert_eq!("table".parse::<MergePolicy>(), Ok(MergePolicy::Table));
        assert!("crdt".parse::<MergePolicy>().is_err());
        assert_eq!(MergePolicy::Table.to_string(), "table");
        assert_eq!(MergePolicy::default(), MergePolicy::LastWriteWins);
    }
}
