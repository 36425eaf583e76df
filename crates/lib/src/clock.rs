//! Time provider abstraction and the hybrid timestamp source.
//!
//! [`Clock`] abstracts over wall-clock time so tests can drive time by hand.
//! [`HybridClock`] turns a [`Clock`] into the monotonically increasing
//! timestamps stamped on every local mutation.
//!
//! # Example
//!
//! ```
//! use meshmap::{Clock, SystemClock};
//!
//! let clock = SystemClock;
//! let millis = clock.now_millis();
//! assert!(millis > 0);
//! ```

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A time provider for getting current timestamps.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now_millis(&self) -> u64;

    /// Returns the current time as an RFC3339-formatted string.
    fn now_rfc3339(&self) -> String {
        let millis = self.now_millis() as i64;
        chrono::DateTime::from_timestamp_millis(millis)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "1970-01-01T00:00:00+00:00".to_string())
    }
}

/// Production clock using real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Test clock that advances by one millisecond on every read.
///
/// Sharing one `FixedClock` between several maps in a test gives every
/// mutation across all of them a distinct, strictly increasing timestamp,
/// which makes conflict outcomes deterministic.
///
/// ```
/// use meshmap::{Clock, FixedClock};
///
/// let clock = FixedClock::new(1000);
/// let t1 = clock.now_millis();
/// let t2 = clock.now_millis();
/// assert_eq!(t1, 1000);
/// assert!(t2 > t1);
/// ```
#[cfg(any(test, feature = "testing"))]
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicU64,
}

#[cfg(any(test, feature = "testing"))]
impl FixedClock {
    /// Create a new fixed clock with the given initial time in milliseconds.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the clock to a specific time in milliseconds.
    pub fn set(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }

    /// Get the current time without advancing.
    pub fn get(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.millis.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for FixedClock {
    fn default() -> Self {
        // 2024-01-01 00:00:00 UTC
        Self::new(1704067200000)
    }
}

/// Monotonic timestamp source combining wall-clock time with the highest
/// timestamp observed so far.
///
/// Every value returned by [`next`](Self::next) is strictly greater than any
/// value previously returned or passed to [`observe`](Self::observe), so a
/// node's writes always order after everything it has already seen.
#[derive(Debug)]
pub struct HybridClock {
    clock: Arc<dyn Clock>,
    last: AtomicU64,
}

impl HybridClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: AtomicU64::new(0),
        }
    }

    /// Issue the next local timestamp.
    pub fn next(&self) -> u64 {
        let now = self.clock.now_millis();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(current) => last = current,
            }
        }
    }

    /// Record a timestamp seen from elsewhere so later local stamps exceed it.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// Highest timestamp issued or observed.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Wall-clock milliseconds from the underlying clock.
    pub fn wall_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The underlying clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
