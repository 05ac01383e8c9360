//! # Core identifier and timestamp types
//!
//! ## Timestamp layout
//!
//! ```text
//!  Bit Index:  63             18 17            0
//!              +----------------+---------------+
//!  Field:      | physical (46)  | logical (18)  |
//!              +----------------+---------------+
//!              |<---- MSB ---------- LSB ----->|
//! ```
//!
//! - `physical`: milliseconds since the Unix epoch, owned by the authority.
//! - `logical`: counter inside one millisecond.
//!
//! Comparing two raw values compares physical time first, then the counter,
//! which is what makes timestamps comparable across the cluster.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Cluster-unique identifier handed out by the [`IdAllocator`].
///
/// [`IdAllocator`]: crate::allocator::IdAllocator
pub type UniqueId = u64;

/// A hybrid logical timestamp issued by the timestamp oracle.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Number of low bits holding the logical counter.
    pub const LOGICAL_BITS: u32 = 18;
    /// Mask selecting the logical counter.
    pub const LOGICAL_MASK: u64 = (1 << Self::LOGICAL_BITS) - 1;
    /// Smallest timestamp; never issued by the authority.
    pub const ZERO: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Builds a timestamp from its physical and logical components.
    pub const fn compose(physical_millis: u64, logical: u64) -> Self {
        Self((physical_millis << Self::LOGICAL_BITS) | (logical & Self::LOGICAL_MASK))
    }

    /// Milliseconds since the Unix epoch.
    pub const fn physical(self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    pub const fn logical(self) -> u64 {
        self.0 & Self::LOGICAL_MASK
    }

    /// Returns the timestamp `millis` milliseconds later, logical counter
    /// reset.
    pub const fn add_millis(self, millis: u64) -> Self {
        Self::compose(self.physical() + millis, 0)
    }

    /// The immediately preceding timestamp, saturating at zero.
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical(), self.logical())
    }
}

/// A source of wall-clock milliseconds.
///
/// This abstraction lets the authority and the segment allocator run against
/// the real clock in production and a hand-driven one in tests.
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn current_millis(&self) -> u64;

    /// The current time as a timestamp with a zero logical counter.
    fn now(&self) -> Timestamp {
        Timestamp::compose(self.current_millis(), 0)
    }
}

/// [`TimeSource`] backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A manually advanced clock. Clones share the same reading.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_splits_back_into_components() {
        let ts = Timestamp::compose(1_700_000_000_000, 42);
        assert_eq!(ts.physical(), 1_700_000_000_000);
        assert_eq!(ts.logical(), 42);
    }

    #[test]
    fn physical_time_dominates_ordering() {
        let earlier = Timestamp::compose(10, Timestamp::LOGICAL_MASK);
        let later = Timestamp::compose(11, 0);
        assert!(earlier < later);
        assert_eq!(later.prev(), earlier);
    }

    #[test]
    fn manual_clock_clones_share_reading() {
        let clock = ManualClock::new(5);
        let other = clock.clone();
        clock.advance(10);
        assert_eq!(other.current_millis(), 15);
        assert_eq!(other.now(), Timestamp::compose(15, 0));
    }
}
