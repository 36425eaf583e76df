//! Error types for the entry store.

use thiserror::Error;

/// Errors raised by local storage operations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// No free slot is left in the key's segment and the key has no slot yet.
    #[error("Capacity exceeded: segment {segment} has no free slot ({slots} slots)")]
    CapacityExceeded {
        /// Index of the full segment
        segment: usize,
        /// Slots per segment
        slots: usize,
    },

    /// Key plus value does not fit in one slot.
    #[error("Entry too large: {size} bytes exceeds entry size {max}")]
    EntryTooLarge {
        /// Bytes of key plus value
        size: usize,
        /// Configured entry size
        max: usize,
    },

    /// The backing region is smaller than the slot layout needs.
    #[error("Backing region too small: need {required} bytes, got {actual}")]
    ArenaTooSmall {
        /// Bytes required by the layout
        required: usize,
        /// Bytes offered by the backing store
        actual: usize,
    },

    /// A segment lock could not be acquired within the configured timeout.
    #[error("Timed out after {timeout_ms}ms waiting for segment {segment} lock")]
    LockTimeout {
        /// Index of the contended segment
        segment: usize,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// The map has been closed.
    #[error("Map is closed")]
    Closed,
}

impl StoreError {
    /// Check if this error means the table is full.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, StoreError::CapacityExceeded { .. })
    }

    /// Check if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    /// Check if this error is caused by the caller's input.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, StoreError::EntryTooLarge { .. })
    }

    /// Check if this error indicates the map was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

impl From<StoreError> for crate::Error {
    fn from(err: StoreError) -> Self {
        crate::Error::Store(err)
    }
}
