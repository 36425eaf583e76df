//! Error types for the entry wire codec.

use thiserror::Error;

/// Errors raised while decoding frames and messages.
///
/// Any of these on an inbound connection means the stream can no longer be
/// trusted; the session owning it is torn down and reconnected.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before a complete field could be read.
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Message tag is not one this protocol version knows.
    #[error("Unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// Tombstone flag byte other than 0 or 1.
    #[error("Invalid tombstone flag {0}")]
    InvalidTombstoneFlag(u8),

    /// Key plus value exceeds the agreed maximum.
    #[error("Entry of {size} bytes exceeds maximum {max}")]
    EntryTooLarge { size: usize, max: usize },

    /// Declared message payload exceeds the reader's limit.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Bytes left over after the declared contents were decoded.
    #[error("{0} trailing bytes after message contents")]
    TrailingBytes(usize),

    /// More entries were pushed into a chunk than its header can count.
    #[error("Chunk holds {0} entries, more than a chunk header can describe")]
    TooManyEntries(usize),

    /// Stored bytes do not decode as the requested typed key or value.
    #[error("Cannot decode {type_name}: {reason}")]
    InvalidValue {
        type_name: &'static str,
        reason: String,
    },
}

impl CodecError {
    /// Check if the input was cut short rather than malformed.
    pub fn is_truncated(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }

    /// Check if a size limit was exceeded.
    pub fn is_size_error(&self) -> bool {
        matches!(
            self,
            CodecError::EntryTooLarge { .. }
                | CodecError::PayloadTooLarge { .. }
                | CodecError::TooManyEntries(_)
        )
    }
}

impl From<CodecError> for crate::Error {
    fn from(err: CodecError) -> Self {
        crate::Error::Codec(err)
    }
}
