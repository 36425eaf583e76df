//! Shared helpers for benchmarks

use std::sync::Arc;

use meshmap::{FixedClock, ReplicatedMap};

/// Creates a standalone map sized for `capacity` entries of up to 64 bytes.
pub fn setup_map(capacity: usize) -> ReplicatedMap {
    ReplicatedMap::builder()
        .identifier(1)
        .entries(capacity)
        .segments(16)
        .entry_size(64)
        .tombstone_grace(std::time::Duration::ZERO)
        .clock(Arc::new(FixedClock::default()))
        .build_local()
        .expect("Failed to build map")
}

/// Creates a map pre-populated with `count` entries.
/// Each entry has format "key_N" -> "value_N" where N is the entry index
pub fn setup_map_with_entries(capacity: usize, count: usize) -> ReplicatedMap {
    let map = setup_map(capacity);
    for i in 0..count {
        map.put(format!("key_{i}"), format!("value_{i}"))
            .expect("Failed to populate map");
    }
    map
}
