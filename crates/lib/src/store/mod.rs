//! Entry store: a fixed arena of equally sized slots split into segments.
//!
//! Each segment owns a contiguous range of the arena, a [`HashPosIndex`]
//! over its slots and a lock. A key's segment is `hash(key) mod segments`;
//! the upper half of the same 64-bit hash feeds the segment's index. Every
//! read or write takes exactly one segment lock, holds it for one slot
//! access plus the matching index update, and releases it on every exit
//! path through the guard's `Drop`.
//!
//! [`HashPosIndex`]: crate::index::HashPosIndex

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::Result;
use crate::backing::BackingStore;
use crate::record::{Mutation, Version};

pub mod errors;
pub(crate) mod segment;
pub mod slot;

pub use errors::StoreError;
pub(crate) use segment::LocalWrite;
use segment::{Segment, SegmentRegion};

/// Hash of a key split into its segment and index components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHash {
    pub segment: usize,
    pub index_hash: u32,
}

/// 64-bit hash of a key: the first eight bytes of its BLAKE3 digest.
pub fn hash_key(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Sizes derived from the configuration, fixed for the life of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    pub entries: usize,
    pub segments: usize,
    pub entry_size: usize,
    pub slot_size: usize,
    pub slots_per_segment: usize,
}

impl StoreLayout {
    pub fn new(entries: usize, segments: usize, entry_size: usize) -> Self {
        let segments = segments.max(1);
        Self {
            entries,
            segments,
            entry_size,
            slot_size: slot::slot_size(entry_size),
            slots_per_segment: entries.div_ceil(segments).max(1),
        }
    }

    /// Bytes the arena must provide.
    pub fn arena_size(&self) -> usize {
        self.segments * self.slots_per_segment * self.slot_size
    }

    pub fn locate(&self, key: &[u8]) -> KeyHash {
        let hash = hash_key(key);
        KeyHash {
            segment: (hash % self.segments as u64) as usize,
            index_hash: (hash >> 32) as u32,
        }
    }
}

pub struct EntryStore {
    // Declared before `backing` so segments drop before the memory they view.
    segments: Box<[Mutex<Segment>]>,
    backing: Box<dyn BackingStore>,
    layout: StoreLayout,
    lock_timeout: Option<Duration>,
}

impl EntryStore {
    /// Lay out `layout` over `backing`, zeroing the region.
    pub fn new(
        layout: StoreLayout,
        mut backing: Box<dyn BackingStore>,
        lock_timeout: Option<Duration>,
    ) -> Result<Self> {
        let required = layout.arena_size();
        if backing.len() < required {
            return Err(StoreError::ArenaTooSmall {
                required,
                actual: backing.len(),
            }
            .into());
        }

        let segment_bytes = layout.slots_per_segment * layout.slot_size;
        let bytes = backing.bytes_mut();
        let mut segments = Vec::with_capacity(layout.segments);
        for (number, chunk) in bytes[..required].chunks_exact_mut(segment_bytes).enumerate() {
            let ptr = NonNull::new(chunk.as_mut_ptr()).ok_or(StoreError::ArenaTooSmall {
                required,
                actual: 0,
            })?;
            // SAFETY: `chunks_exact_mut` yields disjoint ranges of the backing
            // region, which `BackingStore` keeps at a stable address for as
            // long as `self.backing` is alive; segments are dropped first.
            let region = unsafe { SegmentRegion::new(ptr, chunk.len()) };
            segments.push(Mutex::new(Segment::new(
                number,
                region,
                layout.slots_per_segment,
                layout.slot_size,
                layout.entry_size,
            )));
        }

        Ok(Self {
            segments: segments.into_boxed_slice(),
            backing,
            layout,
            lock_timeout,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn lock(&self, segment: usize) -> Result<MutexGuard<'_, Segment>> {
        let mutex = &self.segments[segment];
        match self.lock_timeout {
            None => Ok(mutex.lock()),
            Some(timeout) => mutex.try_lock_for(timeout).ok_or_else(|| {
                StoreError::LockTimeout {
                    segment,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into()
            }),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let at = self.layout.locate(key);
        Ok(self.lock(at.segment)?.get(at.index_hash, key))
    }

    /// Current version held for `key`, live or tombstone.
    pub fn version_of(&self, key: &[u8]) -> Result<Option<Version>> {
        let at = self.layout.locate(key);
        Ok(self.lock(at.segment)?.version_of(at.index_hash, key))
    }

    /// Write a local change. `stamp` runs under the segment lock so that
    /// stamping order and storage order agree for each key.
    pub(crate) fn write_local(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        stamp: impl FnOnce(Option<Version>) -> Version,
        now: u64,
        reclaim_before: u64,
    ) -> Result<LocalWrite> {
        let at = self.layout.locate(key);
        self.lock(at.segment)?
            .write_local(at.index_hash, key, value, stamp, now, reclaim_before)
    }

    /// Apply a peer's record under last-writer-wins; returns whether it won.
    pub fn apply(&self, mutation: &Mutation, now: u64, reclaim_before: u64) -> Result<bool> {
        let at = self.layout.locate(&mutation.key);
        self.lock(at.segment)?
            .apply(at.index_hash, mutation, now, reclaim_before)
    }

    /// Snapshot of every slot, segment by segment.
    pub fn records(&self) -> Result<Vec<Mutation>> {
        let mut all = Vec::new();
        for segment in 0..self.segments.len() {
            all.extend(self.lock(segment)?.records());
        }
        Ok(all)
    }

    /// Snapshot of live pairs, segment by segment.
    pub fn live_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut all = Vec::new();
        for segment in 0..self.segments.len() {
            all.extend(self.lock(segment)?.live_entries());
        }
        Ok(all)
    }

    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for segment in 0..self.segments.len() {
            total += self.lock(segment)?.live();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn tombstones(&self) -> Result<usize> {
        let mut total = 0;
        for segment in 0..self.segments.len() {
            total += self.lock(segment)?.tombstones();
        }
        Ok(total)
    }

    /// Free tombstones written at or before `before` in every segment.
    pub fn reclaim_tombstones(&self, before: u64) -> Result<usize> {
        let mut total = 0;
        for segment in 0..self.segments.len() {
            total += self.lock(segment)?.reclaim_tombstones(before);
        }
        Ok(total)
    }

    pub fn flush(&self) -> Result<()> {
        self.backing.flush()?;
        Ok(())
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("layout", &self.layout)
            .field("backing", &self.backing)
            .finish()
    }
}
