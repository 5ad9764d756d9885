use core::fmt;

use serde::{Deserialize, Serialize};

/// A logical write timestamp.
///
/// Counts nanoseconds since the Unix epoch, so a freshly issued timestamp
/// tracks wall-clock time, but the value is only ever compared, never
/// interpreted as a date. One nanosecond is the smallest step a clock can
/// take.
///
/// Backends store it big-endian (see [`to_be_bytes`](Timestamp::to_be_bytes))
/// so that the byte order of two timestamps matches their numeric order,
/// which time-sorted indexes rely on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch. Used as the watermark of a peer that was never synced.
    pub const ZERO: Self = Self(0);

    /// Create a timestamp from raw nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Raw nanoseconds.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// The smallest timestamp strictly after `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The largest timestamp strictly before `self` (saturates at zero).
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Big-endian encoding, ordered like the numeric value.
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Inverse of [`to_be_bytes`](Self::to_be_bytes).
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Parse the first 8 bytes of `bytes` as a big-endian timestamp.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self::from_be_bytes(head))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}
