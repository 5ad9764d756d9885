use std::sync::Mutex;

/// A conflict-resolution automaton for items that share a key.
///
/// A merger folds several items into one. Implementations must make the
/// result independent of the order of the items after the first one, and
/// folding in the same item twice must be a no-op:
/// - **Commutativity:** `merge([a, b]) == merge([b, a])`
/// - **Idempotency:** `merge([a, a]) == merge([a])`
///
/// Items that fail to decode are ignored, never fatal.
///
/// A merger is single threaded. Concurrent merges each take their own
/// instance from a [`MergePool`].
pub trait Merger {
    /// Reset the state and seed it with the first item.
    fn init(&mut self, item: &[u8]);

    /// Fold in another item.
    fn merge(&mut self, item: &[u8]);

    /// Whether the result differs from the item passed to [`init`](Merger::init).
    fn changed(&self) -> bool;

    /// The serialized resolved item.
    fn result(&self) -> Vec<u8>;

    /// Drop internal state before the instance is pooled.
    fn cleanup(&mut self);
}

/// Produces fresh merger instances.
pub type MergerFactory = fn() -> Box<dyn Merger + Send>;

/// Outcome of [`MergePool::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    /// The resolved item.
    pub item: Vec<u8>,
    /// `true` iff `item` differs from the seed.
    pub changed: bool,
}

/// Idle mergers kept around between merges.
const MAX_IDLE: usize = 64;

/// A pool of mergers produced by one factory.
///
/// Pooling only saves allocations; every merge gets an instance that no
/// other merge is using.
pub struct MergePool {
    factory: MergerFactory,
    idle: Mutex<Vec<Box<dyn Merger + Send>>>,
}

impl MergePool {
    /// Create an empty pool.
    pub fn new(factory: MergerFactory) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Merge `others` into `seed`.
    pub fn merge<'a, I>(&self, seed: &[u8], others: I) -> Merged
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut merger = self.take();
        merger.init(seed);
        for item in others {
            merger.merge(item);
        }
        let merged = Merged {
            changed: merger.changed(),
            item: merger.result(),
        };
        merger.cleanup();
        self.give_back(merger);
        merged
    }

    /// Merge a single incoming item into an existing one.
    pub fn merge_pair(&self, existing: &[u8], incoming: &[u8]) -> Merged {
        self.merge(existing, [incoming])
    }

    fn take(&self) -> Box<dyn Merger + Send> {
        // A poisoned pool only loses its idle instances.
        match self.idle.lock() {
            Ok(mut idle) => idle.pop().unwrap_or_else(|| (self.factory)()),
            Err(_) => (self.factory)(),
        }
    }

    fn give_back(&self, merger: Box<dyn Merger + Send>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE {
                idle.push(merger);
            }
        }
    }
}

impl std::fmt::Debug for MergePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        f.debug_struct("MergePool").field("idle", &idle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keeps the lexicographically largest item.
    #[derive(Default)]
    struct MaxBytes {
        seed: Vec<u8>,
        best: Vec<u8>,
    }

    impl Merger for MaxBytes {
        fn init(&mut self, item: &[u8]) {
            self.seed = item.to_vec();
            self.best = item.to_vec();
        }
        fn merge(&mut self, item: &[u8]) {
            if item > self.best.as_slice() {
                self.best = item.to_vec();
            }
        }
        fn changed(&self) -> bool {
            self.best != self.seed
        }
        fn result(&self) -> Vec<u8> {
            self.best.clone()
        }
        fn cleanup(&mut self) {
            self.seed.clear();
            self.best.clear();
        }
    }

    fn max_bytes() -> Box<dyn Merger + Send> {
        Box::<MaxBytes>::default()
    }

    #[test]
    fn seed_only_is_unchanged() {
        let pool = MergePool::new(max_bytes);
        let merged = pool.merge(b"m", [] as [&[u8]; 0]);
        assert_eq!(merged.item, b"m");
        assert!(!merged.changed);
    }

    #[test]
    fn folds_all_items() {
        let pool = MergePool::new(max_bytes);
        let merged = pool.merge(b"b", [b"a".as_slice(), b"c", b"a"]);
        assert_eq!(merged.item, b"c");
        assert!(merged.changed);
    }

    #[test]
    fn pooled_instances_start_clean() {
        let pool = MergePool::new(max_bytes);
        assert!(pool.merge_pair(b"a", b"z").changed);
        // The reused instance must not remember "z".
        let merged = pool.merge_pair(b"b", b"a");
        assert_eq!(merged.item, b"b");
        assert!(!merged.changed);
    }
}
