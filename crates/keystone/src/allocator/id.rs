use super::{AllocationRange, BatchAllocator, RangeSource};
use crate::{
    authority::Authority, config::AllocatorConfig, error::Result, types::UniqueId,
};
use core::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Leases identifier ranges from the authority.
pub struct IdSource {
    authority: Arc<dyn Authority>,
}

impl IdSource {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }
}

impl RangeSource for IdSource {
    const NAME: &'static str = "id";
    const MAX_BATCH: u32 = u32::MAX;
    const EXPIRES_WHEN_IDLE: bool = false;

    fn fetch(&self, count: u32) -> impl Future<Output = Result<AllocationRange>> + Send {
        self.authority.allocate_ids(count)
    }
}

/// Hands out cluster-unique identifiers.
pub struct IdAllocator {
    batch: BatchAllocator<IdSource>,
}

impl IdAllocator {
    pub fn new(
        authority: Arc<dyn Authority>,
        config: AllocatorConfig,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            batch: BatchAllocator::new(IdSource::new(authority), config, cancel),
        }
    }

    pub fn start(&self) {
        self.batch.start();
    }

    pub async fn close(&self) {
        self.batch.close().await;
    }

    /// A single identifier.
    pub async fn alloc_one(&self) -> Result<UniqueId> {
        Ok(self.batch.allocate(1).await?.start)
    }

    /// `n` consecutive identifiers.
    pub async fn alloc(&self, n: u32) -> Result<AllocationRange> {
        self.batch.allocate(n).await
    }

    pub fn stats(&self) -> &BatchAllocator<IdSource> {
        &self.batch
    }
}
