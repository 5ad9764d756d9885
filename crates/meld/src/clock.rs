//! Per-node logical write clock.
//!
//! The clock issues timestamps that follow wall-clock time when it moves
//! forward and keep counting up by one nanosecond when it does not:
//! - **Strictly monotonic** even under clock skew or bursts of writes
//! - **Restartable** from a persisted watermark, so a restarted node never
//!   reissues a timestamp
//!
//! # Example
//!
//! ```
//! use meld::clock::LogicalClock;
//! use meld::Timestamp;
//!
//! let mut clock = LogicalClock::with_time_source(|| Timestamp::from_nanos(100));
//! assert_eq!(clock.advance(), Timestamp::from_nanos(100));
//! assert_eq!(clock.advance(), Timestamp::from_nanos(101));
//! ```

use crate::Timestamp;

/// A logical clock for a single node.
///
/// Not synchronized; owners that share it across threads wrap it in a lock.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    last: Timestamp,
    /// Wall-clock source. Defaults to [`Timestamp::now`].
    time_fn: fn() -> Timestamp,
}

impl LogicalClock {
    /// Create a clock driven by the system time.
    pub fn new() -> Self {
        Self::with_time_source(Timestamp::now)
    }

    /// Create a clock with a custom wall-clock source.
    pub fn with_time_source(time_fn: fn() -> Timestamp) -> Self {
        Self {
            last: Timestamp::ZERO,
            time_fn,
        }
    }

    /// Continue from a previously persisted watermark.
    ///
    /// The next [`advance`](Self::advance) is guaranteed to be above `from`.
    #[must_use]
    pub fn resume(mut self, from: Timestamp) -> Self {
        self.last = self.last.max(from);
        self
    }

    /// Issue the next timestamp: `max(last + 1ns, now)`.
    pub fn advance(&mut self) -> Timestamp {
        let next = self.last.next().max((self.time_fn)());
        self.last = next;
        next
    }

    /// The last issued (or resumed) timestamp.
    pub fn last(&self) -> Timestamp {
        self.last
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    static MOCK_TIME: AtomicU64 = AtomicU64::new(1000);

    fn mock_time() -> Timestamp {
        Timestamp::from_nanos(MOCK_TIME.load(Ordering::SeqCst))
    }

    fn set_mock_time(nanos: u64) {
        MOCK_TIME.store(nanos, Ordering::SeqCst);
    }

    #[test]
    fn wall_clock_drives_progress_and_stalls_are_bridged() {
        set_mock_time(5000);
        let mut clock = LogicalClock::with_time_source(mock_time);

        assert_eq!(clock.advance().as_nanos(), 5000);
        assert_eq!(clock.advance().as_nanos(), 5001);
        assert_eq!(clock.advance().as_nanos(), 5002);

        set_mock_time(9000);
        assert_eq!(clock.advance().as_nanos(), 9000);

        // Wall clock jumps backward: keep counting from the last issue.
        set_mock_time(10);
        assert_eq!(clock.advance().as_nanos(), 9001);
    }

    #[test]
    fn resume_never_reissues() {
        let mut clock =
            LogicalClock::with_time_source(|| Timestamp::from_nanos(50)).resume(Timestamp::from_nanos(700));
        assert_eq!(clock.last().as_nanos(), 700);
        assert_eq!(clock.advance().as_nanos(), 701);
    }

    #[test]
    fn system_clock_is_strictly_increasing() {
        let mut clock = LogicalClock::new();
        let mut prev = clock.advance();
        for _ in 0..1000 {
            let ts = clock.advance();
            assert!(ts > prev);
            prev = ts;
        }
    }
}
