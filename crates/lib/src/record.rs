//! Replicated mutation records and their total order.
//!
//! A [`Mutation`] is the unit that travels between peers: one key, its new
//! value (or a tombstone), and the [`Version`] stamped by the node that made
//! the change. Versions compare lexicographically on `(timestamp, identifier)`,
//! and a record only ever overwrites local state carrying a strictly smaller
//! version. That rule alone makes every node converge on the same value for a
//! key regardless of the order records arrive in.

use std::fmt;

/// `(timestamp, identifier)` pair ordering all writes to a key.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// breaks ties with `identifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub timestamp: u64,
    pub identifier: u8,
}

impl Version {
    pub fn new(timestamp: u64, identifier: u8) -> Self {
        Self {
            timestamp,
            identifier,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.identifier)
    }
}

/// A single key change as produced locally or received from a peer.
#[derive(Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Vec<u8>,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    pub timestamp: u64,
    pub identifier: u8,
}

impl Mutation {
    /// Create a mutation that sets `key` to `value`.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: Version) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp: version.timestamp,
            identifier: version.identifier,
        }
    }

    /// Create a tombstone for `key`.
    pub fn remove(key: impl Into<Vec<u8>>, version: Version) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp: version.timestamp,
            identifier: version.identifier,
        }
    }

    pub fn version(&self) -> Version {
        Version::new(self.timestamp, self.identifier)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Whether this record wins over local state stamped with `current`.
    pub fn supersedes(&self, current: Version) -> bool {
        self.version() > current
    }

    /// Bytes of key plus value, the quantity bounded by `entry_size`.
    pub fn payload_len(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("key", &hex::encode(&self.key))
            .field("value_len", &self.value.as_ref().map(Vec::len))
            .field("version", &self.version())
            .finish()
    }
}
