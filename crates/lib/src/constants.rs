//! Constants used throughout the meshmap library.
//!
//! Central definitions for protocol numbers, layout sizes and the defaults
//! applied when a [`MapConfig`](crate::config::MapConfig) leaves a field unset.

/// Version carried in every bootstrap message. Peers with a different
/// version are refused during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of distinct node identifiers (identifiers are a single byte).
pub const IDENTIFIER_COUNT: usize = 256;

/// Default fixed capacity of a map, in entries.
pub const DEFAULT_ENTRIES: usize = 1024;

/// Default upper bound on the serialized key plus value of one entry.
pub const DEFAULT_ENTRY_SIZE: usize = 128;

/// Default number of lock-partitioned segments.
pub const DEFAULT_SEGMENTS: usize = 16;

/// Default byte budget used to size outbound chunks.
pub const DEFAULT_CHUNK_BYTE_BUDGET: usize = 8 * 1024;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default bootstrap (handshake plus snapshot) timeout in milliseconds.
pub const DEFAULT_BOOTSTRAP_TIMEOUT_MS: u64 = 5_000;

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default first reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_BACKOFF_INITIAL_MS: u64 = 50;

/// Default ceiling for the reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 5_000;

/// Default grace period before a tombstone may be reclaimed for another key.
pub const DEFAULT_TOMBSTONE_GRACE_MS: u64 = 60_000;

/// A read side that sees nothing for this many heartbeat intervals
/// considers the connection dead.
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;
