//! Fixed-width slot layout.
//!
//! ```text
//! offset  size  field
//! 0       1     state (0 empty, 1 live, 2 tombstone)
//! 1       1     identifier of the writing node
//! 2       2     reserved
//! 4       4     key length
//! 8       4     value length
//! 12      4     index hash of the key
//! 16      8     timestamp
//! 24      8     local wall-clock millis when the slot was last written
//! 32      ..    key bytes followed by value bytes
//! ```
//!
//! All integers are little-endian.

use crate::record::{Mutation, Version};

pub const SLOT_HEADER_SIZE: usize = 32;

const STATE: usize = 0;
const IDENTIFIER: usize = 1;
const KEY_LEN: usize = 4;
const VALUE_LEN: usize = 8;
const HASH: usize = 12;
const TIMESTAMP: usize = 16;
const WRITTEN_AT: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Live = 1,
    Tombstone = 2,
}

impl SlotState {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => SlotState::Live,
            2 => SlotState::Tombstone,
            _ => SlotState::Empty,
        }
    }
}

/// Bytes per slot for a given entry size, rounded up to 8-byte alignment.
pub fn slot_size(entry_size: usize) -> usize {
    (SLOT_HEADER_SIZE + entry_size).div_ceil(8) * 8
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Read-only view over one slot's bytes.
#[derive(Clone, Copy)]
pub struct SlotView<'a> {
    bytes: &'a [u8],
}

impl<'a> SlotView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_byte(self.bytes[STATE])
    }

    pub fn identifier(&self) -> u8 {
        self.bytes[IDENTIFIER]
    }

    pub fn hash(&self) -> u32 {
        read_u32(self.bytes, HASH)
    }

    pub fn timestamp(&self) -> u64 {
        read_u64(self.bytes, TIMESTAMP)
    }

    pub fn written_at(&self) -> u64 {
        read_u64(self.bytes, WRITTEN_AT)
    }

    pub fn version(&self) -> Version {
        Version::new(self.timestamp(), self.identifier())
    }

    pub fn key(&self) -> &'a [u8] {
        let len = read_u32(self.bytes, KEY_LEN) as usize;
        &self.bytes[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + len]
    }

    /// Value bytes; empty for tombstones.
    pub fn value(&self) -> &'a [u8] {
        let key_len = read_u32(self.bytes, KEY_LEN) as usize;
        let len = read_u32(self.bytes, VALUE_LEN) as usize;
        let start = SLOT_HEADER_SIZE + key_len;
        &self.bytes[start..start + len]
    }

    /// Owned copy of the slot as a replicable record.
    pub fn to_mutation(&self) -> Mutation {
        Mutation {
            key: self.key().to_vec(),
            value: match self.state() {
                SlotState::Live => Some(self.value().to_vec()),
                _ => None,
            },
            timestamp: self.timestamp(),
            identifier: self.identifier(),
        }
    }
}

/// Everything written into a slot in one go.
pub struct SlotWrite<'a> {
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
    pub hash: u32,
    pub version: Version,
    pub written_at: u64,
}

/// Overwrite a slot wholesale. The caller guarantees the key and value fit.
pub fn write(bytes: &mut [u8], slot: &SlotWrite<'_>) {
    let value = slot.value.unwrap_or_default();
    let state = if slot.value.is_some() {
        SlotState::Live
    } else {
        SlotState::Tombstone
    };
    bytes[STATE] = state as u8;
    bytes[IDENTIFIER] = slot.version.identifier;
    bytes[2] = 0;
    bytes[3] = 0;
    bytes[KEY_LEN..KEY_LEN + 4].copy_from_slice(&(slot.key.len() as u32).to_le_bytes());
    bytes[VALUE_LEN..VALUE_LEN + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
    bytes[HASH..HASH + 4].copy_from_slice(&slot.hash.to_le_bytes());
    bytes[TIMESTAMP..TIMESTAMP + 8].copy_from_slice(&slot.version.timestamp.to_le_bytes());
    bytes[WRITTEN_AT..WRITTEN_AT + 8].copy_from_slice(&slot.written_at.to_le_bytes());

    let key_end = SLOT_HEADER_SIZE + slot.key.len();
    bytes[SLOT_HEADER_SIZE..key_end].copy_from_slice(slot.key);
    bytes[key_end..key_end + value.len()].copy_from_slice(value);
}

/// Return a slot to the empty state.
pub fn erase(bytes: &mut [u8]) {
    bytes.fill(0);
}
