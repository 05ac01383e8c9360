use super::{AllocationRange, BatchAllocator, RangeSource};
use crate::{
    authority::Authority,
    config::AllocatorConfig,
    error::Result,
    types::Timestamp,
};
use core::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Leases timestamp ranges from the authority's oracle.
pub struct TimestampSource {
    authority: Arc<dyn Authority>,
}

impl TimestampSource {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }
}

impl RangeSource for TimestampSource {
    const NAME: &'static str = "timestamp";
    const MAX_BATCH: u32 = 1 << Timestamp::LOGICAL_BITS;
    const EXPIRES_WHEN_IDLE: bool = true;

    fn fetch(&self, count: u32) -> impl Future<Output = Result<AllocationRange>> + Send {
        self.authority.allocate_timestamps(count)
    }
}

/// Client of the timestamp oracle.
///
/// Timestamps come out strictly increasing in the order calls return, across
/// all callers of one allocator.
pub struct TimestampAllocator {
    batch: BatchAllocator<TimestampSource>,
}

impl TimestampAllocator {
    pub fn new(
        authority: Arc<dyn Authority>,
        config: AllocatorConfig,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            batch: BatchAllocator::new(TimestampSource::new(authority), config, cancel),
        }
    }

    pub fn start(&self) {
        self.batch.start();
    }

    pub async fn close(&self) {
        self.batch.close().await;
    }

    pub async fn get_timestamp(&self) -> Result<Timestamp> {
        let range = self.batch.allocate(1).await?;
        Ok(Timestamp::from_raw(range.start))
    }

    /// Reserves `n` consecutive timestamps; iterate the range with
    /// [`Timestamp::from_raw`].
    pub async fn get_timestamps(&self, n: u32) -> Result<AllocationRange> {
        self.batch.allocate(n).await
    }

    pub fn stats(&self) -> &BatchAllocator<TimestampSource> {
        &self.batch
    }
}
