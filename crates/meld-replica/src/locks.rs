use std::sync::{Mutex, MutexGuard, PoisonError};

use xxhash_rust::xxh3::xxh3_64;

/// Number of lock shards.
pub const SHARDS: usize = 64;

/// A fixed table of mutexes selected by key hash.
///
/// Writers to the same key always meet on the same shard. Unrelated keys
/// may share one too; that only costs some contention.
pub struct KeyLocks {
    shards: [Mutex<()>; SHARDS],
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Index of the shard guarding `key`.
    pub fn shard(key: &[u8]) -> usize {
        (xxh3_64(key) % SHARDS as u64) as usize
    }

    /// Block until `key`'s shard is free.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned shard holds no broken state.
        self.shards[Self::shard(key)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks").field("shards", &SHARDS).finish()
    }
}
