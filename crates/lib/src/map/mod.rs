//! The replicated map facade.
//!
//! [`ReplicatedMap`] is a cheap-to-clone handle around shared state: the
//! entry store, the hybrid clock that stamps local writes, the last-seen
//! vector and the outbound queues feeding replication sessions. Sessions
//! hold a [`WeakMap`] so that dropping the last handle tears the whole node
//! down.
//!
//! ## Example
//!
//! ```
//! # use meshmap::{MapConfig, ReplicatedMap};
//! # fn main() -> meshmap::Result<()> {
//! let map = ReplicatedMap::open_local(MapConfig::new(1))?;
//! map.put(b"greeting", b"hello")?;
//! assert_eq!(map.get(b"greeting")?, Some(b"hello".to_vec()));
//! assert!(map.remove(b"greeting")?);
//! assert!(map.is_empty()?);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::Result;
use crate::clock::HybridClock;
use crate::config::MapConfig;
use crate::constants::IDENTIFIER_COUNT;
use crate::record::{Mutation, Version};
use crate::replication::{OutboundQueues, PeerInfo, Replicator, SessionId};
use crate::store::{EntryStore, LocalWrite, StoreError};

mod builder;
mod typed;

pub use builder::MapBuilder;
pub use typed::{BinaryCodec, TypedMap};

struct MapInner {
    config: MapConfig,
    store: EntryStore,
    clock: HybridClock,
    /// Highest timestamp seen per origin identifier.
    last_seen: Box<[AtomicU64]>,
    queues: Arc<OutboundQueues>,
    replicator: Mutex<Option<Replicator>>,
    closed: AtomicBool,
}

impl MapInner {
    fn record_seen(&self, identifier: u8, timestamp: u64) {
        self.last_seen[identifier as usize].fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// A fixed-capacity byte map replicated to every configured peer.
#[derive(Clone)]
pub struct ReplicatedMap {
    inner: Arc<MapInner>,
}

/// Weak handle that does not keep the map alive.
#[derive(Clone)]
pub struct WeakMap {
    inner: Weak<MapInner>,
}

impl WeakMap {
    /// Upgrade to a strong handle, or `None` once every handle has dropped.
    pub fn upgrade(&self) -> Option<ReplicatedMap> {
        self.inner.upgrade().map(|inner| ReplicatedMap { inner })
    }
}

impl fmt::Debug for WeakMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakMap")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl ReplicatedMap {
    pub fn builder() -> MapBuilder {
        MapBuilder::new()
    }

    /// Open a node with replication as configured.
    pub async fn open(config: MapConfig) -> Result<Self> {
        MapBuilder::from_config(config).open().await
    }

    /// Open a map without any networking.
    pub fn open_local(config: MapConfig) -> Result<Self> {
        MapBuilder::from_config(config).build_local()
    }

    pub(crate) fn from_parts(config: MapConfig, store: EntryStore, clock: HybridClock) -> Self {
        let last_seen = (0..IDENTIFIER_COUNT).map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(MapInner {
                config,
                store,
                clock,
                last_seen,
                queues: Arc::new(OutboundQueues::new()),
                replicator: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) async fn start_replication(&self) -> Result<()> {
        let replicator = Replicator::start(self).await?;
        *self.inner.replicator.lock() = Some(replicator);
        Ok(())
    }

    pub fn downgrade(&self) -> WeakMap {
        WeakMap {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn identifier(&self) -> u8 {
        self.inner.config.identifier
    }

    pub fn config(&self) -> &MapConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &HybridClock {
        &self.inner.clock
    }

    pub(crate) fn queues(&self) -> &Arc<OutboundQueues> {
        &self.inner.queues
    }

    /// Encoded size bound of one entry frame.
    pub fn max_entry_size(&self) -> usize {
        self.inner.config.max_entry_size()
    }

    /// Address the replication listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .replicator
            .lock()
            .as_ref()
            .and_then(Replicator::local_addr)
    }

    /// Status of every replication session.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .replicator
            .lock()
            .as_ref()
            .map(Replicator::peers)
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed.into());
        }
        Ok(())
    }

    fn reclaim_before(&self, now: u64) -> u64 {
        now.saturating_sub(self.inner.config.tombstone_grace_ms)
    }

    /// Store a local change, stamp it and queue it for every session.
    /// Returns whether the key held a live value before.
    fn write_local(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let inner = &self.inner;
        let identifier = inner.config.identifier;
        let now = inner.clock.wall_millis();
        let stamp = |previous: Option<Version>| {
            let mut timestamp = inner.clock.next();
            if let Some(previous) = previous
                && timestamp <= previous.timestamp
            {
                inner.clock.observe(previous.timestamp);
                timestamp = inner.clock.next();
            }
            Version::new(timestamp, identifier)
        };

        let LocalWrite { mutation, was_live } =
            inner
                .store
                .write_local(key, value, stamp, now, self.reclaim_before(now))?;
        inner.record_seen(mutation.identifier, mutation.timestamp);
        let version = mutation.version();
        let queued = inner.queues.publish(Arc::new(mutation), None);
        trace!(key = %hex::encode(key), %version, queued, tombstone = value.is_none(), "Local write");
        Ok(was_live)
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.inner.store.get(key.as_ref())
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Version currently held for `key`, including tombstones.
    pub fn version_of(&self, key: impl AsRef<[u8]>) -> Result<Option<Version>> {
        self.ensure_open()?;
        self.inner.store.version_of(key.as_ref())
    }

    /// Set `key` to `value`.
    ///
    /// Fails with a capacity error when the key is new and its segment has
    /// no free slot, and with a validation error when key plus value exceed
    /// the configured entry size.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_open()?;
        self.write_local(key.as_ref(), Some(value.as_ref()))?;
        Ok(())
    }

    /// Delete `key`, leaving a tombstone that replicates the deletion.
    ///
    /// Returns whether a live value was removed. A key unknown locally still
    /// gets a tombstone when its segment has room, so the delete wins over
    /// older writes that have yet to arrive.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.ensure_open()?;
        let key = key.as_ref();
        match self.write_local(key, None) {
            Ok(was_live) => Ok(was_live),
            Err(e) if e.is_capacity_error() => {
                debug!(key = %hex::encode(key), "No free slot for tombstone of absent key");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove every live key. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for (key, _) in self.entries()? {
            if self.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of tombstones currently holding a slot.
    pub fn tombstones(&self) -> Result<usize> {
        self.ensure_open()?;
        self.inner.store.tombstones()
    }

    /// Snapshot of live `(key, value)` pairs.
    ///
    /// Taken one segment at a time, so writes racing with the call may or
    /// may not be included.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        self.inner.store.live_entries()
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<(Vec<u8>, Vec<u8>)>> {
        Ok(self.entries()?.into_iter())
    }

    /// Highest timestamp seen per origin, omitting origins never seen.
    pub fn last_seen_vector(&self) -> Vec<(u8, u64)> {
        self.inner
            .last_seen
            .iter()
            .enumerate()
            .filter_map(|(identifier, seen)| {
                let timestamp = seen.load(Ordering::Acquire);
                (timestamp > 0).then_some((identifier as u8, timestamp))
            })
            .collect()
    }

    /// Every record, tombstones included, newer than what `last_seen`
    /// reports for the record's origin, oldest first.
    ///
    /// The receiver raises its last-seen timestamp with every record it
    /// applies, so any prefix of this batch must also be a prefix of each
    /// origin's records. Otherwise a connection lost partway through would
    /// hide the undelivered older records from every later catch-up.
    pub fn changes_since(&self, last_seen: &[(u8, u64)]) -> Result<Vec<Mutation>> {
        self.ensure_open()?;
        let mut seen = [0u64; IDENTIFIER_COUNT];
        for &(identifier, timestamp) in last_seen {
            let slot = &mut seen[identifier as usize];
            *slot = (*slot).max(timestamp);
        }
        let mut changes: Vec<Mutation> = self
            .inner
            .store
            .records()?
            .into_iter()
            .filter(|m| m.timestamp > seen[m.identifier as usize])
            .collect();
        changes.sort_unstable_by_key(|m| (m.timestamp, m.identifier));
        Ok(changes)
    }

    /// Apply a record received from a peer under last-writer-wins.
    ///
    /// A record that wins is re-published to every session except `origin`.
    /// Returns whether it won.
    pub fn apply_remote(&self, mutation: &Mutation, origin: Option<SessionId>) -> Result<bool> {
        self.ensure_open()?;
        let inner = &self.inner;
        let now = inner.clock.wall_millis();
        let applied = inner
            .store
            .apply(mutation, now, self.reclaim_before(now))?;
        inner.clock.observe(mutation.timestamp);
        inner.record_seen(mutation.identifier, mutation.timestamp);
        if applied {
            inner.queues.publish(Arc::new(mutation.clone()), origin);
        }
        Ok(applied)
    }

    /// Free tombstones older than the configured grace period.
    pub fn purge_tombstones(&self) -> Result<usize> {
        self.ensure_open()?;
        let now = self.inner.clock.wall_millis();
        self.inner.store.reclaim_tombstones(self.reclaim_before(now))
    }

    /// Flush a file-backed arena to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.store.flush()
    }

    /// Stop replication and reject further operations. Idempotent.
    ///
    /// The arena itself is released when the last handle is dropped.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let replicator = self.inner.replicator.lock().take();
        self.inner.queues.close_all();
        if let Some(replicator) = replicator {
            replicator.shutdown().await;
        }
        self.inner.store.flush()?;
        info!(node = self.identifier(), "Map closed");
        Ok(())
    }
}

impl fmt::Debug for ReplicatedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedMap")
            .field("identifier", &self.identifier())
            .field("store", &self.inner.store)
            .field("closed", &self.is_closed())
            .finish()
    }
}
