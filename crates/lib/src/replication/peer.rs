//! Peer bookkeeping for replication sessions.
//!
//! Every session owns one entry in the [`PeerRegistry`]. Connector entries
//! live as long as the replicator and carry their history across
//! reconnects; acceptor entries are removed when the inbound connection ends.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Session state machine. Any state falls back to `Disconnected` on failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Establishing the TCP connection.
    Connecting,
    /// Exchanging identifiers and last-seen vectors, then catching the peer up.
    Bootstrapping,
    /// Steady state: mutations flow both ways as they happen.
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Bootstrapping => "bootstrapping",
            ConnectionState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerRole {
    /// We dial the peer and redial after failures.
    Connector,
    /// The peer dialled us.
    Acceptor,
}

/// Snapshot of one session's status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote socket address.
    pub address: SocketAddr,
    pub role: PeerRole,
    /// Identifier learned from the peer's bootstrap message.
    pub identifier: Option<u8>,
    pub state: ConnectionState,
    /// Connection attempts made so far (connectors only).
    pub connection_attempts: u32,
    pub last_error: Option<String>,
    /// RFC 3339 time of the last completed bootstrap.
    pub last_bootstrap: Option<String>,
    pub entries_sent: u64,
    pub entries_received: u64,
}

impl PeerInfo {
    pub fn new(address: SocketAddr, role: PeerRole) -> Self {
        Self {
            address,
            role,
            identifier: None,
            state: ConnectionState::Disconnected,
            connection_attempts: 0,
            last_error: None,
            last_bootstrap: None,
            entries_sent: 0,
            entries_received: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ConnectionState::Streaming
    }
}

/// Registry key of one peer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerKey(u64);

/// Shared table of peer status, updated by sessions and read by the map.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    next: AtomicU64,
    peers: Mutex<BTreeMap<PeerKey, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: SocketAddr, role: PeerRole) -> PeerKey {
        let key = PeerKey(self.next.fetch_add(1, Ordering::Relaxed));
        self.peers.lock().insert(key, PeerInfo::new(address, role));
        key
    }

    pub fn remove(&self, key: PeerKey) {
        self.peers.lock().remove(&key);
    }

    /// Apply `f` to the entry for `key`, if it is still registered.
    pub fn update(&self, key: PeerKey, f: impl FnOnce(&mut PeerInfo)) {
        if let Some(info) = self.peers.lock().get_mut(&key) {
            f(info);
        }
    }

    /// Record the identifier a peer announced for `key`.
    ///
    /// Connectors dial distinct configured addresses, so two connector
    /// entries at different addresses announcing the same identifier are two
    /// nodes sharing it. In that case nothing is recorded and the address of
    /// the entry that claimed it first is returned.
    pub fn claim_identifier(&self, key: PeerKey, identifier: u8) -> Result<(), SocketAddr> {
        let mut peers = self.peers.lock();
        let Some((address, role)) = peers.get(&key).map(|info| (info.address, info.role)) else {
            return Ok(());
        };
        if role == PeerRole::Connector {
            let holder = peers.iter().find(|(other, info)| {
                **other != key
                    && info.role == PeerRole::Connector
                    && info.address != address
                    && info.identifier == Some(identifier)
            });
            if let Some((_, holder)) = holder {
                return Err(holder.address);
            }
        }
        if let Some(info) = peers.get_mut(&key) {
            info.identifier = Some(identifier);
        }
        Ok(())
    }

    pub fn set_state(&self, key: PeerKey, state: ConnectionState) {
        self.update(key, |info| info.state = state);
    }

    pub fn get(&self, key: PeerKey) -> Option<PeerInfo> {
        self.peers.lock().get(&key).cloned()
    }

    /// All entries in registration order.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
