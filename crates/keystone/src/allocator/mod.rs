//! Batch-leasing allocators.
//!
//! Every allocator here follows the same pattern: lease a numeric range from
//! the [`Authority`], serve callers from the cached range, and refill before
//! it runs dry so that callers rarely wait on a round trip.
//!
//! - [`BatchAllocator`] - the generic pattern, parameterized by a
//!   [`RangeSource`].
//! - [`IdAllocator`] - unique object identifiers.
//! - [`TimestampAllocator`] - the timestamp oracle client.
//! - [`SegmentAllocator`] - per-(collection, partition, channel) segment
//!   leases with capacity and expiry.
//!
//! [`Authority`]: crate::authority::Authority

mod backoff;
mod batch;
mod id;
mod segment;
mod tso;


pub use backoff::{RetryPolicy, with_backoff};
pub use batch::{BatchAllocator, RangeSource};
pub use id::{IdAllocator, IdSource};
pub use segment::{SegmentAllocator, SegmentAssignment};
pub use tso::{TimestampAllocator, TimestampSource};

use serde::{Deserialize, Serialize};

/// A half-open range of values `[start, end)` leased from the authority.
///
/// Values are consumed from the front only, so `start` never moves backwards
/// and no value is handed out twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRange {
    pub start: u64,
    pub end: u64,
    /// Batch size requested on the RPC that produced this range.
    pub per_request_cost: u32,
}

impl AllocationRange {
    pub const fn new(start: u64, end: u64, per_request_cost: u32) -> Self {
        Self {
            start,
            end,
            per_request_cost,
        }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Splits off the first `n` values, advancing `start`.
    ///
    /// Callers must check `len() >= n` first.
    pub(crate) fn take_front(&mut self, n: u64) -> Self {
        debug_assert!(self.len() >= n);
        let taken = Self::new(self.start, self.start + n, self.per_request_cost);
        self.start += n;
        taken
    }

    pub fn iter(&self) -> core::ops::Range<u64> {
        self.start..self.end
    }
}
