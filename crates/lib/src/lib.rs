//!
//! Meshmap: a fixed-capacity key-value map over a single memory arena, kept
//! consistent across a mesh of peers by a binary TCP replication protocol.
//!
//! ## Core Concepts
//!
//! * **Hash-Position Index (`index::HashPosIndex`)**: an open-addressing multimap from 32-bit hashes to slot positions, searched through explicit cursors.
//! * **Entry Store (`store::EntryStore`)**: equally sized slots split into segments, each segment guarded by its own lock and paired with its own index.
//! * **Backing stores (`backing::BackingStore`)**: the byte region the store lives in, either heap memory or a `memmap2` mapping.
//! * **Wire codec (`codec`)**: entry frames, chunk batching and the bootstrap handshake message.
//! * **Replication (`replication`)**: one session per peer connection, moving through `Disconnected → Connecting → Bootstrapping → Streaming`.
//! * **Map facade (`map::ReplicatedMap`)**: stamps local writes with `(timestamp, identifier)` and fans them out to every session; inbound records are applied last-writer-wins and re-published to the rest of the mesh.

pub mod backing;
pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod index;
pub mod map;
pub mod record;
pub mod replication;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub use clock::FixedClock;
pub use clock::{Clock, HybridClock, SystemClock};
pub use config::MapConfig;
pub use map::{BinaryCodec, MapBuilder, ReplicatedMap, TypedMap, WeakMap};
pub use record::{Mutation, Version};
pub use replication::{ConnectionState, PeerInfo};

/// Result type used throughout the meshmap library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the meshmap library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured storage errors from the store module
    #[error(transparent)]
    Store(store::StoreError),

    /// Structured wire format errors from the codec module
    #[error(transparent)]
    Codec(codec::CodecError),

    /// Structured replication errors from the replication module
    #[error(transparent)]
    Replication(replication::ReplicationError),

    /// Structured configuration errors from the config module
    #[error(transparent)]
    Config(config::ConfigError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Store(_) => "store",
            Error::Codec(_) => "codec",
            Error::Replication(_) => "replication",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error means the table had no room for a new key.
    pub fn is_capacity_error(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_capacity_error(),
            _ => false,
        }
    }

    /// Check if the operation may succeed when simply tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_retryable(),
            Error::Replication(repl_err) => repl_err.is_network_error(),
            _ => false,
        }
    }

    /// Check if this error is validation-related.
    pub fn is_validation_error(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_validation_error(),
            Error::Codec(codec_err) => codec_err.is_size_error(),
            _ => false,
        }
    }

    /// Check if this error is network related.
    pub fn is_network_error(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Replication(repl_err) => repl_err.is_network_error(),
            _ => false,
        }
    }

    /// Check if this error stems from a bad or inconsistent configuration.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::Replication(repl_err) => repl_err.is_configuration_error(),
            _ => false,
        }
    }

    /// Check if this error is a malformed wire message.
    pub fn is_codec_error(&self) -> bool {
        match self {
            Error::Codec(_) => true,
            Error::Replication(repl_err) => repl_err.is_protocol_error(),
            _ => false,
        }
    }

    /// Check if the map was already closed.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_closed(),
            Error::Replication(repl_err) => repl_err.is_map_closed(),
            _ => false,
        }
    }
}
