//! One lock-partitioned slice of the slot array and its hash-position index.

use std::collections::BTreeSet;
use std::ptr::NonNull;

use tracing::trace;

use super::errors::StoreError;
use super::slot::{self, SlotState, SlotView, SlotWrite};
use crate::Result;
use crate::index::HashPosIndex;
use crate::record::{Mutation, Version};

/// Raw view of a segment's bytes inside the arena.
///
/// Segments split the arena into disjoint ranges, so two `SegmentRegion`s
/// never alias. A region is only reachable through its [`Segment`], which
/// only lives behind that segment's lock.
pub(crate) struct SegmentRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a plain byte range owned by the arena, which outlives
// every segment; access is serialized by the segment lock.
unsafe impl Send for SegmentRegion {}

impl SegmentRegion {
    /// # Safety
    ///
    /// `ptr..ptr+len` must be valid for reads and writes for the lifetime of
    /// the region and must not overlap any other live region.
    pub(crate) unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the constructor contract; `&mut self` makes
        // the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Outcome of a local write.
#[derive(Debug)]
pub(crate) struct LocalWrite {
    pub mutation: Mutation,
    /// Whether the key held a live value before the write.
    pub was_live: bool,
}

pub(crate) struct Segment {
    number: usize,
    region: SegmentRegion,
    index: HashPosIndex,
    slot_size: usize,
    slots: usize,
    entry_size: usize,
    /// Free positions; popped from the back.
    free: Vec<u32>,
    live: usize,
    tombstones: usize,
}

impl Segment {
    pub(crate) fn new(
        number: usize,
        region: SegmentRegion,
        slots: usize,
        slot_size: usize,
        entry_size: usize,
    ) -> Self {
        let mut segment = Self {
            number,
            region,
            index: HashPosIndex::with_capacity(slots),
            slot_size,
            slots,
            entry_size,
            free: Vec::with_capacity(slots),
            live: 0,
            tombstones: 0,
        };
        segment.reset();
        segment
    }

    fn reset(&mut self) {
        self.region.bytes_mut().fill(0);
        self.index.clear();
        self.free.clear();
        self.free.extend((0..self.slots as u32).rev());
        self.live = 0;
        self.tombstones = 0;
    }

    fn slot(&self, pos: u32) -> SlotView<'_> {
        let start = pos as usize * self.slot_size;
        SlotView::new(&self.region.bytes()[start..start + self.slot_size])
    }

    fn slot_mut(&mut self, pos: u32) -> &mut [u8] {
        let start = pos as usize * self.slot_size;
        let size = self.slot_size;
        &mut self.region.bytes_mut()[start..start + size]
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Position of the slot holding `key`, live or tombstone.
    fn find(&self, hash: u32, key: &[u8]) -> Option<u32> {
        let mut cursor = self.index.start_search(hash);
        while let Some(pos) = self.index.next_pos(&mut cursor) {
            if self.slot(pos).key() == key {
                return Some(pos);
            }
        }
        None
    }

    pub(crate) fn get(&self, hash: u32, key: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find(hash, key)?;
        let view = self.slot(pos);
        match view.state() {
            SlotState::Live => Some(view.value().to_vec()),
            _ => None,
        }
    }

    /// Current version stored for `key`, if any slot holds it.
    pub(crate) fn version_of(&self, hash: u32, key: &[u8]) -> Option<Version> {
        self.find(hash, key).map(|pos| self.slot(pos).version())
    }

    fn check_fits(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let size = key.len() + value.map_or(0, <[u8]>::len);
        if size > self.entry_size {
            return Err(StoreError::EntryTooLarge {
                size,
                max: self.entry_size,
            }
            .into());
        }
        Ok(())
    }

    /// Take a free position, reclaiming expired tombstones if none is left.
    fn allocate(&mut self, reclaim_before: u64) -> Result<u32> {
        if let Some(pos) = self.free.pop() {
            return Ok(pos);
        }
        let reclaimed = self.reclaim_tombstones(reclaim_before);
        if reclaimed > 0 {
            trace!(segment = self.number, reclaimed, "Reclaimed tombstones under pressure");
        }
        self.free.pop().ok_or_else(|| {
            StoreError::CapacityExceeded {
                segment: self.number,
                slots: self.slots,
            }
            .into()
        })
    }

    /// Write `value` (or a tombstone) for `key` at an existing or fresh slot.
    fn store(
        &mut self,
        existing: Option<u32>,
        hash: u32,
        key: &[u8],
        value: Option<&[u8]>,
        version: Version,
        written_at: u64,
        reclaim_before: u64,
    ) -> Result<()> {
        let pos = match existing {
            Some(pos) => {
                match self.slot(pos).state() {
                    SlotState::Live => self.live -= 1,
                    SlotState::Tombstone => self.tombstones -= 1,
                    SlotState::Empty => {}
                }
                pos
            }
            None => {
                let pos = self.allocate(reclaim_before)?;
                self.index.put(hash, pos);
                pos
            }
        };
        slot::write(
            self.slot_mut(pos),
            &SlotWrite {
                key,
                value,
                hash,
                version,
                written_at,
            },
        );
        if value.is_some() {
            self.live += 1;
        } else {
            self.tombstones += 1;
        }
        Ok(())
    }

    /// Apply a change made on this node.
    ///
    /// `stamp` is called with the key's current version (if any) and must
    /// return a version strictly greater than it.
    pub(crate) fn write_local(
        &mut self,
        hash: u32,
        key: &[u8],
        value: Option<&[u8]>,
        stamp: impl FnOnce(Option<Version>) -> Version,
        now: u64,
        reclaim_before: u64,
    ) -> Result<LocalWrite> {
        self.check_fits(key, value)?;
        let existing = self.find(hash, key);
        let previous = existing.map(|pos| self.slot(pos));
        let was_live = previous.is_some_and(|view| view.state() == SlotState::Live);
        let version = stamp(previous.map(|view| view.version()));
        debug_assert!(previous.is_none_or(|view| version > view.version()));

        self.store(existing, hash, key, value, version, now, reclaim_before)?;
        Ok(LocalWrite {
            mutation: Mutation {
                key: key.to_vec(),
                value: value.map(<[u8]>::to_vec),
                timestamp: version.timestamp,
                identifier: version.identifier,
            },
            was_live,
        })
    }

    /// Apply a record received from a peer under last-writer-wins.
    ///
    /// Returns whether local state changed.
    pub(crate) fn apply(
        &mut self,
        hash: u32,
        mutation: &Mutation,
        now: u64,
        reclaim_before: u64,
    ) -> Result<bool> {
        self.check_fits(&mutation.key, mutation.value.as_deref())?;
        let existing = self.find(hash, &mutation.key);
        if let Some(pos) = existing
            && !mutation.supersedes(self.slot(pos).version())
        {
            return Ok(false);
        }
        self.store(
            existing,
            hash,
            &mutation.key,
            mutation.value.as_deref(),
            mutation.version(),
            now,
            reclaim_before,
        )?;
        Ok(true)
    }

    /// Every occupied position, found through a full index scan.
    fn occupied(&self) -> BTreeSet<u32> {
        let mut seen = BTreeSet::new();
        let mut cursor = self.index.first_pos();
        while let Some(at) = cursor {
            seen.extend(self.index.positions(at.hash()));
            cursor = self.index.next_different_hash_non_empty_position(&at);
        }
        seen
    }

    /// Every slot as a record, tombstones included.
    pub(crate) fn records(&self) -> Vec<Mutation> {
        self.occupied()
            .into_iter()
            .map(|pos| self.slot(pos).to_mutation())
            .collect()
    }

    /// Live `(key, value)` pairs.
    pub(crate) fn live_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.occupied()
            .into_iter()
            .map(|pos| self.slot(pos))
            .filter(|view| view.state() == SlotState::Live)
            .map(|view| (view.key().to_vec(), view.value().to_vec()))
            .collect()
    }

    /// Free tombstone slots last written at or before `before`.
    pub(crate) fn reclaim_tombstones(&mut self, before: u64) -> usize {
        if self.tombstones == 0 {
            return 0;
        }
        let expired: Vec<(u32, u32)> = self
            .occupied()
            .into_iter()
            .map(|pos| (pos, self.slot(pos)))
            .filter(|(_, view)| view.state() == SlotState::Tombstone && view.written_at() <= before)
            .map(|(pos, view)| (pos, view.hash()))
            .collect();
        for (pos, hash) in &expired {
            self.index.remove(*hash, *pos);
            slot::erase(self.slot_mut(*pos));
            self.free.push(*pos);
            self.tombstones -= 1;
        }
        expired.len()
    }
}
