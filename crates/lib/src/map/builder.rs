//! Fluent construction of [`ReplicatedMap`]s.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::ReplicatedMap;
use crate::Result;
use crate::backing::{BackingStore, MmapRegion};
use crate::clock::{Clock, HybridClock, SystemClock};
use crate::config::MapConfig;
use crate::store::{EntryStore, StoreLayout};

/// Builder over a [`MapConfig`] plus the collaborators a config cannot name:
/// the clock and the memory region the store lives in.
///
/// Without an explicit backing store the arena is an anonymous memory
/// mapping, or a file mapping when [`arena_file`](Self::arena_file) is set.
pub struct MapBuilder {
    config: MapConfig,
    clock: Option<Arc<dyn Clock>>,
    backing: Option<Box<dyn BackingStore>>,
    arena_file: Option<PathBuf>,
}

impl Default for MapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapBuilder {
    pub fn new() -> Self {
        Self::from_config(MapConfig::default())
    }

    pub fn from_config(config: MapConfig) -> Self {
        Self {
            config,
            clock: None,
            backing: None,
            arena_file: None,
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn identifier(mut self, identifier: u8) -> Self {
        self.config.identifier = identifier;
        self
    }

    pub fn entries(mut self, entries: usize) -> Self {
        self.config.entries = entries;
        self
    }

    pub fn entry_size(mut self, entry_size: usize) -> Self {
        self.config.entry_size = entry_size;
        self
    }

    pub fn segments(mut self, segments: usize) -> Self {
        self.config.segments = segments;
        self
    }

    pub fn listen(mut self, address: SocketAddr) -> Self {
        self.config.listen = Some(address);
        self
    }

    pub fn peer(mut self, address: SocketAddr) -> Self {
        self.config.peers.push(address);
        self
    }

    pub fn peers(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.config.peers.extend(addresses);
        self
    }

    pub fn chunk_byte_budget(mut self, budget: usize) -> Self {
        self.config.chunk_byte_budget = budget;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.config.bootstrap_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff_initial_ms = initial.as_millis() as u64;
        self.config.reconnect_backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn tombstone_grace(mut self, grace: Duration) -> Self {
        self.config.tombstone_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Time source for timestamps and tombstone ageing.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Region to lay the store out in. Must be at least the layout's size.
    pub fn backing(mut self, backing: Box<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    /// Map the arena onto a file, created or truncated to size.
    pub fn arena_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.arena_file = Some(path.into());
        self
    }

    /// Validate the configuration and lay out the store, without networking.
    pub fn build_local(self) -> Result<ReplicatedMap> {
        self.config.validate()?;
        let layout = StoreLayout::new(
            self.config.entries,
            self.config.segments,
            self.config.entry_size,
        );
        let backing: Box<dyn BackingStore> = match (self.backing, &self.arena_file) {
            (Some(backing), _) => backing,
            (None, Some(path)) => Box::new(MmapRegion::create(path, layout.arena_size())?),
            (None, None) => Box::new(MmapRegion::anonymous(layout.arena_size())?),
        };
        info!(
            node = self.config.identifier,
            entries = layout.entries,
            segments = layout.segments,
            slot_size = layout.slot_size,
            backing = backing.kind(),
            "Opening map"
        );
        let store = EntryStore::new(layout, backing, self.config.lock_timeout())?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let clock = HybridClock::new(clock);
        Ok(ReplicatedMap::from_parts(self.config, store, clock))
    }

    /// Build the map and start replicating with the configured peers.
    pub async fn open(self) -> Result<ReplicatedMap> {
        let map = self.build_local()?;
        map.start_replication().await?;
        Ok(map)
    }
}
