//! The same storage contract, checked against every compiled-in backend.

use std::ops::ControlFlow;

use meld::{LwwItem, MergePolicy, Timestamp};
use meld_store::{MemoryStore, ReplicaStore};

fn lww(ts: u64, value: &str) -> Vec<u8> {
    LwwItem::write(Timestamp::from_nanos(ts), value.as_bytes().to_vec()).encode()
}

fn backends() -> Vec<(&'static str, Box<dyn ReplicaStore>)> {
    let policy = MergePolicy::LastWriteWins;
    #[allow(unused_mut)]
    let mut stores: Vec<(&'static str, Box<dyn ReplicaStore>)> =
        vec![("memory", Box::new(MemoryStore::new(policy)))];
    #[cfg(feature = "redb")]
    stores.push(("redb", Box::new(meld_store::RedbStore::open_in_memory(policy).unwrap())));
    #[cfg(feature = "sqlite")]
    stores.push(("sqlite", Box::new(meld_store::SqliteStore::open_in_memory(policy).unwrap())));
    stores
}

#[test]
fn submit_order_does_not_matter() {
    for (name, store) in backends() {
        store.submit(b"a", &lww(1, "x")).unwrap();
        store.submit(b"a", &lww(3, "z")).unwrap();
        store.submit(b"a", &lww(2, "y")).unwrap();
        store.submit(b"a", &lww(3, "z")).unwrap();
        assert_eq!(store.obtain(b"a").unwrap(), Some(lww(3, "z")), "{name}");
    }
}

#[test]
fn scan_can_stop_early() {
    for (name, store) in backends() {
        for i in 1..=2000u64 {
            store
                .record_update(format!("k{i}").as_bytes(), Timestamp::from_nanos(i))
                .unwrap();
        }
        let first: Vec<_> = store
            .read_all_since(Timestamp::ZERO)
            .take(3)
            .map(|r| r.unwrap().timestamp.as_nanos())
            .collect();
        assert_eq!(first, vec![1, 2, 3], "{name}");

        let tail = store.read_all_since(Timestamp::from_nanos(1998)).count();
        assert_eq!(tail, 2, "{name}");
    }
}

#[test]
fn stream_and_time_vector() {
    for (name, store) in backends() {
        store.submit(b"k1", &lww(1, "a")).unwrap();
        store.submit(b"k2", &lww(1, "b")).unwrap();
        let mut seen = Vec::new();
        store
            .stream(&mut |key, item| {
                seen.push((key.to_vec(), item.to_vec()));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![(b"k1".to_vec(), lww(1, "a")), (b"k2".to_vec(), lww(1, "b"))],
            "{name}"
        );

        assert_eq!(store.query_watermark("self").unwrap(), None, "{name}");
        store.update_watermark("self", Timestamp::from_nanos(42)).unwrap();
        assert_eq!(
            store.query_watermark("self").unwrap(),
            Some(Timestamp::from_nanos(42)),
            "{name}"
        );
    }
}
