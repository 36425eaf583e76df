//! Error types for replication sessions.
//!
//! None of these reach callers of map operations: they end the session that
//! raised them, which either reconnects or, for fatal problems, stays down.

use std::net::SocketAddr;

use thiserror::Error;

use crate::codec::CodecError;

/// Errors that end a replication session.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Inbound bytes could not be decoded.
    #[error("Malformed frame from {address}: {source}")]
    MalformedFrame {
        address: SocketAddr,
        #[source]
        source: CodecError,
    },

    /// Outbound connection attempt failed.
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: SocketAddr, reason: String },

    /// Peer closed the connection.
    #[error("Connection to {address} closed by peer")]
    ConnectionClosed { address: SocketAddr },

    /// A bounded phase ran past its deadline.
    #[error("{phase} with {address} timed out after {timeout_ms}ms")]
    Timeout {
        phase: &'static str,
        address: SocketAddr,
        timeout_ms: u64,
    },

    /// The peer claims this node's own identifier.
    #[error("Peer {address} uses identifier {identifier}, which is this node's identifier")]
    DuplicateIdentifier { address: SocketAddr, identifier: u8 },

    /// Two configured peers announce the same identifier.
    #[error("Peer {address} uses identifier {identifier}, already used by peer {holder}")]
    SharedIdentifier {
        address: SocketAddr,
        holder: SocketAddr,
        identifier: u8,
    },

    /// Peer speaks another protocol version.
    #[error("Protocol version mismatch: expected {expected}, received {received}")]
    ProtocolMismatch { expected: u32, received: u32 },

    /// Handshake did not follow the protocol.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Listener could not be bound.
    #[error("Failed to bind listener to {address}: {reason}")]
    ServerBind { address: SocketAddr, reason: String },

    /// The map the session replicates has been closed or dropped.
    #[error("Map closed")]
    MapClosed,
}

impl ReplicationError {
    /// Check if this is a transient network problem worth reconnecting for.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::ConnectionFailed { .. }
                | ReplicationError::ConnectionClosed { .. }
                | ReplicationError::Timeout { .. }
        )
    }

    /// Check if the peer sent something that breaks the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::MalformedFrame { .. } | ReplicationError::HandshakeFailed(_)
        )
    }

    /// Check if this is a mesh misconfiguration that retrying cannot fix.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::DuplicateIdentifier { .. }
                | ReplicationError::SharedIdentifier { .. }
                | ReplicationError::ProtocolMismatch { .. }
                | ReplicationError::ServerBind { .. }
        )
    }

    pub fn is_map_closed(&self) -> bool {
        matches!(self, ReplicationError::MapClosed)
    }

    /// Check if the session must stay down instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        self.is_configuration_error() || self.is_map_closed()
    }
}

impl From<ReplicationError> for crate::Error {
    fn from(err: ReplicationError) -> Self {
        crate::Error::Replication(err)
    }
}
