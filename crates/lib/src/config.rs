//! Construction-time configuration.
//!
//! A [`MapConfig`] fixes everything that cannot change once a map exists:
//! capacity, slot width, segment count and this node's identifier, along with
//! the replication endpoints and timing. Durations are carried as whole
//! milliseconds so the JSON form stays flat.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Result;
use crate::codec;
use crate::constants::*;

/// Configuration problems detected by [`MapConfig::validate`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Capacity must be at least one entry")]
    ZeroEntries,

    #[error("Entry size must be at least one byte")]
    ZeroEntrySize,

    #[error("Segment count {segments} must be a power of two no greater than {entries} entries")]
    InvalidSegments { segments: usize, entries: usize },

    #[error("Chunk byte budget {budget} cannot hold one frame of {required} bytes")]
    ChunkBudgetTooSmall { budget: usize, required: usize },

    #[error("Listen address {address} also appears as a peer")]
    ListenAddressInPeers { address: SocketAddr },

    #[error("Peer {address} listed more than once")]
    DuplicatePeer { address: SocketAddr },

    #[error("Heartbeat interval must be non-zero")]
    ZeroHeartbeat,
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err)
    }
}

/// Settings for one node of a replicated map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Fixed capacity in entries; the arena never grows.
    pub entries: usize,
    /// This node's identifier. Must be unique across the mesh.
    pub identifier: u8,
    /// Upper bound on key plus value bytes of one entry.
    pub entry_size: usize,
    /// Number of lock-partitioned segments.
    pub segments: usize,
    /// Address to accept peer connections on.
    pub listen: Option<SocketAddr>,
    /// Peers this node connects out to.
    pub peers: Vec<SocketAddr>,
    /// Bytes an outbound chunk is sized against. Inbound chunks are held to
    /// the same bound, so every node in a mesh uses the same budget.
    pub chunk_byte_budget: usize,
    pub connect_timeout_ms: u64,
    pub bootstrap_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Bound on waiting for a segment lock; unbounded when absent.
    pub lock_timeout_ms: Option<u64>,
    /// How long a tombstone must age before another key may take its slot.
    pub tombstone_grace_ms: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ENTRIES,
            identifier: 1,
            entry_size: DEFAULT_ENTRY_SIZE,
            segments: DEFAULT_SEGMENTS,
            listen: None,
            peers: Vec::new(),
            chunk_byte_budget: DEFAULT_CHUNK_BYTE_BUDGET,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            bootstrap_timeout_ms: DEFAULT_BOOTSTRAP_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_backoff_initial_ms: DEFAULT_RECONNECT_BACKOFF_INITIAL_MS,
            reconnect_backoff_max_ms: DEFAULT_RECONNECT_BACKOFF_MAX_MS,
            lock_timeout_ms: None,
            tombstone_grace_ms: DEFAULT_TOMBSTONE_GRACE_MS,
        }
    }
}

impl MapConfig {
    /// Default configuration for the given node identifier.
    pub fn new(identifier: u8) -> Self {
        Self {
            identifier,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration for values a map cannot be built from.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.entries == 0 {
            return Err(ConfigError::ZeroEntries);
        }
        if self.entry_size == 0 {
            return Err(ConfigError::ZeroEntrySize);
        }
        if !self.segments.is_power_of_two() || self.segments > self.entries {
            return Err(ConfigError::InvalidSegments {
                segments: self.segments,
                entries: self.entries,
            });
        }
        if self.chunk_byte_budget < self.max_entry_size() {
            return Err(ConfigError::ChunkBudgetTooSmall {
                budget: self.chunk_byte_budget,
                required: self.max_entry_size(),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if let Some(listen) = self.listen
            && self.peers.contains(&listen)
        {
            return Err(ConfigError::ListenAddressInPeers { address: listen });
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].contains(peer) {
                return Err(ConfigError::DuplicatePeer { address: *peer });
            }
        }
        Ok(())
    }

    /// Encoded size bound of one entry frame.
    pub fn max_entry_size(&self) -> usize {
        codec::max_entry_size(self.entry_size)
    }

    /// Frames per outbound chunk.
    pub fn max_entries_per_chunk(&self) -> u16 {
        codec::max_entries_per_chunk(self.chunk_byte_budget, self.max_entry_size())
    }

    /// Largest chunk payload accepted from a peer.
    pub fn max_chunk_payload(&self) -> usize {
        codec::max_chunk_payload(self.max_entries_per_chunk(), self.max_entry_size())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence on the read side after which a connection counts as dead.
    pub fn read_idle_timeout(&self) -> Duration {
        self.heartbeat_interval() * HEARTBEAT_MISS_LIMIT
    }

    pub fn reconnect_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_initial_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_millis(self.tombstone_grace_ms)
    }
}
