//! Multi-node sync scenarios over in-process transports.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use meld::{LogicalClock, LwwItem, MergePolicy, TableRow, Timestamp};
use meld_replica::{
    Change, ChangeStream, LocalPeer, Replica, SyncError, SyncStatus, SyncTransport, Syncer, Updater,
};
use meld_store::{MemoryStore, RedbStore, StorageFacade, StoreError, TimeVector, UpdateLog};

fn at_100() -> Timestamp {
    Timestamp::from_nanos(100)
}

fn at_101() -> Timestamp {
    Timestamp::from_nanos(101)
}

fn at_1000() -> Timestamp {
    Timestamp::from_nanos(1000)
}

fn node(id: &str, policy: MergePolicy, clock: fn() -> Timestamp) -> Replica<MemoryStore> {
    Replica::with_clock(
        id,
        Arc::new(MemoryStore::new(policy)),
        policy,
        LogicalClock::with_time_source(clock),
    )
    .unwrap()
}

fn lww(ts: u64, value: &str) -> Vec<u8> {
    LwwItem::write(Timestamp::from_nanos(ts), value.as_bytes().to_vec()).encode()
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_nodes_converge_on_latest_write() {
    let a = node("a", MergePolicy::LastWriteWins, at_100);
    let b = node("b", MergePolicy::LastWriteWins, at_101);

    assert_eq!(a.updater().write(b"k", &lww(100, "v1")).unwrap().as_nanos(), 100);
    assert_eq!(b.updater().write(b"k", &lww(101, "v2")).unwrap().as_nanos(), 101);

    a.syncer()
        .sync_with("b", &LocalPeer::new(b.clone()))
        .await
        .unwrap();
    b.syncer()
        .sync_with("a", &LocalPeer::new(a.clone()))
        .await
        .unwrap();

    for replica in [&a, &b] {
        let item = replica.store().obtain(b"k").unwrap().unwrap();
        assert_eq!(LwwItem::decode(&item).unwrap().value(), Some(b"v2".as_slice()));
    }
    assert_eq!(a.syncer().cursor("b").unwrap().as_nanos(), 101);
    assert_eq!(b.syncer().cursor("a").unwrap().as_nanos(), 101);
}

#[tokio::test]
async fn table_rows_converge_field_by_field() {
    let a = node("a", MergePolicy::Table, at_100);
    let b = node("b", MergePolicy::Table, at_101);

    let base = TableRow::put([("name", b"lamp".to_vec()), ("state", b"off".to_vec())], at_100());
    a.updater().write(b"dev", &base.to_item()).unwrap();
    b.syncer()
        .sync_with("a", &LocalPeer::new(a.clone()))
        .await
        .unwrap();

    let on = TableRow::put([("state", b"on".to_vec())], Timestamp::from_nanos(150));
    let room = TableRow::put([("room", b"hall".to_vec())], Timestamp::from_nanos(140));
    b.updater().write(b"dev", &on.to_item()).unwrap();
    a.updater().write(b"dev", &room.to_item()).unwrap();

    a.syncer()
        .sync_with("b", &LocalPeer::new(b.clone()))
        .await
        .unwrap();
    b.syncer()
        .sync_with("a", &LocalPeer::new(a.clone()))
        .await
        .unwrap();

    let on_a = a.store().obtain(b"dev").unwrap().unwrap();
    let on_b = b.store().obtain(b"dev").unwrap().unwrap();
    assert_eq!(on_a, on_b);

    let row = TableRow::from_item(&on_a).unwrap();
    assert_eq!(row.get("name"), Some(b"lamp".as_slice()));
    assert_eq!(row.get("state"), Some(b"on".as_slice()));
    assert_eq!(row.get("room"), Some(b"hall".as_slice()));
}

#[tokio::test]
async fn writes_propagate_through_an_intermediate_node() {
    let a = node("a", MergePolicy::LastWriteWins, at_100);
    let b = node("b", MergePolicy::LastWriteWins, at_100);
    let c = node("c", MergePolicy::LastWriteWins, at_100);

    a.updater().write(b"k", &lww(7, "from a")).unwrap();
    b.syncer()
        .sync_with("a", &LocalPeer::new(a.clone()))
        .await
        .unwrap();
    c.syncer()
        .sync_with("b", &LocalPeer::new(b.clone()))
        .await
        .unwrap();

    assert_eq!(c.store().obtain(b"k").unwrap(), Some(lww(7, "from a")));
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

/// Counts every mutation that reaches the wrapped store.
struct CountingFacade {
    inner: Arc<MemoryStore>,
    mutations: AtomicUsize,
}

impl StorageFacade for CountingFacade {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.inner.submit(key, item)
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.obtain(key)
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        self.inner.stream(visit)
    }
}

#[tokio::test]
async fn second_sync_against_unchanged_peer_does_nothing() {
    let b = node("b", MergePolicy::LastWriteWins, at_101);
    for key in ["x", "y", "z"] {
        b.updater().write(key.as_bytes(), &lww(1, key)).unwrap();
    }

    let local = Arc::new(MemoryStore::new(MergePolicy::LastWriteWins));
    let facade = Arc::new(CountingFacade {
        inner: Arc::clone(&local),
        mutations: AtomicUsize::new(0),
    });
    let syncer = Syncer::new(Arc::clone(&facade), Arc::clone(&local));
    let peer = LocalPeer::new(b);

    let first = syncer.sync_with("b", &peer).await.unwrap();
    assert_eq!(first.status, SyncStatus::Pulled);
    assert_eq!(first.applied, 3);
    let after_first = facade.mutations.load(Ordering::SeqCst);
    assert_eq!(after_first, 3);

    let second = syncer.sync_with("b", &peer).await.unwrap();
    assert_eq!(second.status, SyncStatus::UpToDate);
    assert_eq!(second.cursor, first.cursor);
    assert_eq!(facade.mutations.load(Ordering::SeqCst), after_first);
}

#[tokio::test]
async fn nodes_that_agree_stop_relogging() {
    let a = node("a", MergePolicy::LastWriteWins, at_100);
    let b = node("b", MergePolicy::LastWriteWins, at_101);
    a.updater().write(b"k", &lww(5, "same")).unwrap();

    let to_a = LocalPeer::new(a.clone());
    let to_b = LocalPeer::new(b.clone());
    b.syncer().sync_with("a", &to_a).await.unwrap();
    a.syncer().sync_with("b", &to_b).await.unwrap();
    let version = a.version().unwrap();

    // A already holds what B relogged, so nothing new is stamped.
    assert_eq!(
        a.syncer().sync_with("b", &to_b).await.unwrap().status,
        SyncStatus::UpToDate
    );
    assert_eq!(a.version().unwrap(), version);
}

// ---------------------------------------------------------------------------
// Partial failure
// ---------------------------------------------------------------------------

/// Delivers the first `limit` changes, then fails the stream.
struct FlakyPeer<S: ?Sized> {
    inner: LocalPeer<S>,
    limit: usize,
}

#[async_trait]
impl SyncTransport for FlakyPeer<MemoryStore> {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        self.inner.version().await
    }

    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError> {
        let changes = self.inner.changes_since(since).await?;
        let reset = stream::once(async { Err(SyncError::Transport("connection reset".into())) });
        Ok(changes.take(self.limit).chain(reset).boxed())
    }
}

/// Records every `since` it is asked for.
struct RecordingPeer<S: ?Sized> {
    inner: LocalPeer<S>,
    asked: Mutex<Vec<Timestamp>>,
}

#[async_trait]
impl SyncTransport for RecordingPeer<MemoryStore> {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        self.inner.version().await
    }

    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError> {
        self.asked.lock().unwrap().push(since);
        self.inner.changes_since(since).await
    }
}

#[tokio::test]
async fn failed_stream_keeps_partial_progress() {
    let a = node("a", MergePolicy::LastWriteWins, at_100);
    let b = node("b", MergePolicy::LastWriteWins, at_1000);
    for i in 0..10 {
        let at = b
            .updater()
            .write(format!("k{i}").as_bytes(), &lww(1, "v"))
            .unwrap();
        assert_eq!(at.as_nanos(), 1000 + i);
    }

    let flaky = FlakyPeer {
        inner: LocalPeer::new(b.clone()),
        limit: 6,
    };
    let err = a.syncer().sync_with("b", &flaky).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(a.syncer().cursor("b").unwrap().as_nanos(), 1005);
    assert_eq!(a.store().item_count().unwrap(), 6);

    let recording = RecordingPeer {
        inner: LocalPeer::new(b.clone()),
        asked: Mutex::new(Vec::new()),
    };
    let report = a.syncer().sync_with("b", &recording).await.unwrap();
    assert_eq!(recording.asked.lock().unwrap().as_slice(), &[Timestamp::from_nanos(1005)]);
    assert_eq!(report.applied, 4);
    assert_eq!(report.cursor.as_nanos(), 1009);
    assert_eq!(a.store().item_count().unwrap(), 10);
}

/// A facade whose submits start failing after `ok` successes.
struct FailingFacade {
    inner: Arc<MemoryStore>,
    ok: AtomicUsize,
}

impl StorageFacade for FailingFacade {
    fn submit(&self, key: &[u8], item: &[u8]) -> Result<(), StoreError> {
        if self
            .ok
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.submit(key, item)
    }

    fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.obtain(key)
    }

    fn stream(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        self.inner.stream(visit)
    }
}

#[tokio::test]
async fn failed_apply_advances_only_past_applied_changes() {
    let b = node("b", MergePolicy::LastWriteWins, at_1000);
    for i in 0..5 {
        b.updater()
            .write(format!("k{i}").as_bytes(), &lww(1, "v"))
            .unwrap();
    }

    let local = Arc::new(MemoryStore::new(MergePolicy::LastWriteWins));
    let facade = Arc::new(FailingFacade {
        inner: Arc::clone(&local),
        ok: AtomicUsize::new(2),
    });
    let syncer = Syncer::new(facade, Arc::clone(&local));

    let err = syncer
        .sync_with("b", &LocalPeer::new(b))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Backend(_))));
    assert_eq!(local.query_watermark("b").unwrap(), Some(Timestamp::from_nanos(1001)));
    assert_eq!(local.item_count().unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Batched apply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batched_apply_into_redb() {
    let b = node("b", MergePolicy::LastWriteWins, at_1000);
    for i in 0..20 {
        b.updater()
            .write(format!("k{i:02}").as_bytes(), &lww(i, "v"))
            .unwrap();
    }

    let local = Arc::new(RedbStore::open_in_memory(MergePolicy::LastWriteWins).unwrap());
    assert!(local.start_batch().unwrap().is_some());
    let syncer = Syncer::new(Arc::clone(&local), Arc::clone(&local));

    let report = syncer.sync_with("b", &LocalPeer::new(b)).await.unwrap();
    assert_eq!(report.applied, 20);
    assert_eq!(report.cursor.as_nanos(), 1019);
    assert_eq!(local.obtain(b"k07").unwrap(), Some(lww(7, "v")));
    assert_eq!(local.query_watermark("b").unwrap(), Some(Timestamp::from_nanos(1019)));
}

/// Sends one change, then leaves the stream open forever.
struct StalledPeer;

#[async_trait]
impl SyncTransport for StalledPeer {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        Ok(Some(Timestamp::from_nanos(7)))
    }

    async fn changes_since(&self, _since: Timestamp) -> Result<ChangeStream, SyncError> {
        let first = Change {
            key: b"remote".to_vec(),
            timestamp: Timestamp::from_nanos(7),
            found: true,
            item: lww(7, "theirs"),
        };
        Ok(stream::once(async move { Ok(first) })
            .chain(stream::pending())
            .boxed())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_peer_does_not_block_local_writes() {
    let local = Arc::new(RedbStore::open_in_memory(MergePolicy::LastWriteWins).unwrap());
    let syncer = Syncer::new(Arc::clone(&local), Arc::clone(&local));
    let run = tokio::spawn(async move { syncer.sync_with("slow", &StalledPeer).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = Arc::clone(&local);
    let write = tokio::task::spawn_blocking(move || store.submit(b"local", &lww(1, "mine")));
    let written = tokio::time::timeout(Duration::from_secs(2), write).await;
    assert!(matches!(written, Ok(Ok(Ok(())))));
    assert_eq!(local.obtain(b"local").unwrap(), Some(lww(1, "mine")));

    assert!(!run.is_finished());
    run.abort();
    assert_eq!(local.query_watermark("slow").unwrap(), None);
}

#[tokio::test]
async fn replica_on_redb_syncs() {
    let open = |id: &str| {
        let store = Arc::new(RedbStore::open_in_memory(MergePolicy::LastWriteWins).unwrap());
        Replica::open(id, store, MergePolicy::LastWriteWins).unwrap()
    };
    let a = open("a");
    let b = open("b");
    b.updater().submit(b"k", &lww(3, "persisted")).unwrap();

    let report = a
        .syncer()
        .sync_with("b", &LocalPeer::new(b.clone()))
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(a.store().obtain(b"k").unwrap(), Some(lww(3, "persisted")));
    assert!(a.store().query_update(b"k").unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

#[test]
fn concurrent_writes_get_distinct_increasing_stamps() {
    let store = Arc::new(MemoryStore::new(MergePolicy::LastWriteWins));
    let updater = Arc::new(Updater::open("a", store, MergePolicy::LastWriteWins).unwrap());
    let item = lww(1, "v");

    let per_thread: Vec<Vec<Timestamp>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let updater = Arc::clone(&updater);
                let item = item.clone();
                s.spawn(move || {
                    (0..200)
                        .map(|i| {
                            updater
                                .write(format!("t{t}-k{i}").as_bytes(), &item)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all = BTreeSet::new();
    for stamps in &per_thread {
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        all.extend(stamps.iter().copied());
    }
    assert_eq!(all.len(), 8 * 200);
    assert_eq!(updater.stable_watermark().unwrap(), *all.last().unwrap());
}
