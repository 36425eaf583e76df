//! Entry store tests over heap and memory-mapped arenas.

use std::time::Duration;

use meshmap::backing::{BackingStore, HeapRegion, MmapRegion};
use meshmap::store::{EntryStore, StoreLayout};
use meshmap::{Mutation, Version};

fn heap_store(entries: usize, segments: usize, entry_size: usize) -> EntryStore {
    let layout = StoreLayout::new(entries, segments, entry_size);
    let backing = Box::new(HeapRegion::zeroed(layout.arena_size()));
    EntryStore::new(layout, backing, None).expect("Failed to create store")
}

fn put(key: &str, value: &str, ts: u64, id: u8) -> Mutation {
    Mutation::put(key.as_bytes(), value.as_bytes(), Version::new(ts, id))
}

fn tombstone(key: &str, ts: u64, id: u8) -> Mutation {
    Mutation::remove(key.as_bytes(), Version::new(ts, id))
}

#[test]
fn test_last_writer_wins_on_timestamp_then_identifier() {
    let store = heap_store(64, 4, 32);

    assert!(store.apply(&put("k", "first", 10, 1), 0, 0).unwrap());
    assert!(!store.apply(&put("k", "older", 9, 9), 0, 0).unwrap());
    assert!(store.apply(&put("k", "tie-higher-id", 10, 2), 0, 0).unwrap());
    assert!(!store.apply(&put("k", "tie-lower-id", 10, 1), 0, 0).unwrap());

    assert_eq!(store.get(b"k").unwrap(), Some(b"tie-higher-id".to_vec()));
    assert_eq!(store.version_of(b"k").unwrap(), Some(Version::new(10, 2)));
}

#[test]
fn test_reapplying_the_same_record_is_a_no_op() {
    let store = heap_store(64, 4, 32);
    let m = put("k", "v", 5, 3);
    assert!(store.apply(&m, 0, 0).unwrap());
    assert!(!store.apply(&m, 0, 0).unwrap());
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.records().unwrap(), vec![m]);
}

#[test]
fn test_tombstone_hides_value_but_keeps_version() {
    let store = heap_store(64, 4, 32);
    store.apply(&put("k", "v", 5, 1), 0, 0).unwrap();
    assert!(store.apply(&tombstone("k", 6, 2), 0, 0).unwrap());

    assert_eq!(store.get(b"k").unwrap(), None);
    assert_eq!(store.len().unwrap(), 0);
    assert_eq!(store.tombstones().unwrap(), 1);
    assert_eq!(store.version_of(b"k").unwrap(), Some(Version::new(6, 2)));

    // An older put must not resurrect the key.
    assert!(!store.apply(&put("k", "stale", 4, 9), 0, 0).unwrap());
    assert_eq!(store.get(b"k").unwrap(), None);
    assert!(store.records().unwrap()[0].is_tombstone());
}

#[test]
fn test_full_segment_reports_capacity() {
    let store = heap_store(4, 1, 16);
    for i in 0..4 {
        store.apply(&put(&format!("k{i}"), "v", 1, 1), 0, 0).unwrap();
    }
    let err = store.apply(&put("k4", "v", 1, 1), 0, 0).unwrap_err();
    assert!(err.is_capacity_error());
    assert_eq!(err.module(), "store");

    // Existing keys can still be overwritten.
    assert!(store.apply(&put("k0", "w", 2, 1), 0, 0).unwrap());
    assert_eq!(store.get(b"k0").unwrap(), Some(b"w".to_vec()));
}

#[test]
fn test_expired_tombstones_are_reclaimed_under_pressure() {
    let store = heap_store(2, 1, 16);
    store.apply(&put("a", "1", 1, 1), 100, 0).unwrap();
    store.apply(&tombstone("b", 2, 1), 100, 0).unwrap();

    // Tombstone written at 100 is not yet reclaimable before 100.
    assert!(store.apply(&put("c", "3", 3, 1), 150, 99).unwrap_err().is_capacity_error());

    assert!(store.apply(&put("c", "3", 3, 1), 250, 150).unwrap());
    assert_eq!(store.tombstones().unwrap(), 0);
    assert_eq!(store.version_of(b"b").unwrap(), None);
    assert_eq!(store.get(b"c").unwrap(), Some(b"3".to_vec()));
}

#[test]
fn test_reclaim_tombstones_respects_write_time() {
    let store = heap_store(64, 4, 16);
    store.apply(&tombstone("old", 1, 1), 10, 0).unwrap();
    store.apply(&tombstone("new", 2, 1), 50, 0).unwrap();
    store.apply(&put("live", "v", 3, 1), 5, 0).unwrap();

    assert_eq!(store.reclaim_tombstones(20).unwrap(), 1);
    assert_eq!(store.version_of(b"old").unwrap(), None);
    assert!(store.version_of(b"new").unwrap().is_some());
    assert_eq!(store.get(b"live").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_oversized_entry_is_rejected() {
    let store = heap_store(16, 2, 8);
    let err = store.apply(&put("key", "too-long", 1, 1), 0, 0).unwrap_err();
    assert!(err.is_validation_error());
    assert!(store.is_empty().unwrap());
    // Exactly the entry size fits.
    assert!(store.apply(&put("key", "12345", 1, 1), 0, 0).unwrap());
}

#[test]
fn test_undersized_backing_is_rejected() {
    let layout = StoreLayout::new(64, 4, 32);
    let backing = Box::new(HeapRegion::zeroed(layout.arena_size() - 1));
    let err = EntryStore::new(layout, backing, None).unwrap_err();
    assert!(matches!(err, meshmap::Error::Store(ref e) if !e.is_capacity_error()));
}

#[test]
fn test_store_over_file_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arena.bin");
    let layout = StoreLayout::new(128, 8, 48);
    let region = MmapRegion::create(&path, layout.arena_size()).unwrap();
    assert_eq!(region.len(), layout.arena_size());

    let store = EntryStore::new(layout, Box::new(region), Some(Duration::from_millis(50))).unwrap();
    for i in 0..100 {
        store
            .apply(&put(&format!("key-{i}"), &format!("value-{i}"), i + 1, 1), 0, 0)
            .unwrap();
    }
    store.flush().unwrap();

    assert_eq!(store.len().unwrap(), 100);
    assert_eq!(store.get(b"key-42").unwrap(), Some(b"value-42".to_vec()));
    assert_eq!(
        std::fs::metadata(&path).unwrap().len() as usize,
        layout.arena_size()
    );
}

#[test]
fn test_keys_spread_across_segments() {
    let layout = StoreLayout::new(1024, 16, 32);
    let mut used = std::collections::BTreeSet::new();
    for i in 0..200 {
        let at = layout.locate(format!("key-{i}").as_bytes());
        assert!(at.segment < 16);
        used.insert(at.segment);
    }
    assert_eq!(used.len(), 16);
}

#[test]
fn test_live_entries_skip_tombstones() {
    let store = heap_store(64, 4, 32);
    store.apply(&put("a", "1", 1, 1), 0, 0).unwrap();
    store.apply(&put("b", "2", 1, 1), 0, 0).unwrap();
    store.apply(&tombstone("a", 2, 1), 0, 0).unwrap();

    assert_eq!(store.live_entries().unwrap(), vec![(b"b".to_vec(), b"2".to_vec())]);
    assert_eq!(store.records().unwrap().len(), 2);
}
