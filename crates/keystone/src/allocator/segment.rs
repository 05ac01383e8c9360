use super::with_backoff;
use crate::{
    authority::{Authority, SegmentKey, SegmentLease, SegmentRequest},
    config::SegmentConfig,
    error::{Error, Result},
    types::{TimeSource, Timestamp, UniqueId},
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const NAME: &str = "segment";

/// Rows carved out of a segment lease for one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SegmentAssignment {
    pub segment_id: UniqueId,
    pub key: SegmentKey,
    /// First slot of the assignment inside the segment.
    pub row_offset: u64,
    pub row_count: u64,
    pub expires_at: Timestamp,
}

type LeaseSlot = Arc<tokio::sync::Mutex<Option<SegmentLease>>>;

/// Caches one segment lease per (collection, partition, channel) and carves
/// row assignments out of it.
///
/// Each key has its own async lock, so renewals are single-flight per key
/// and requests on different keys never wait on each other.
pub struct SegmentAllocator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    authority: Arc<dyn Authority>,
    clock: Arc<dyn TimeSource>,
    config: SegmentConfig,
    leases: Mutex<HashMap<SegmentKey, LeaseSlot>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    renewals: AtomicU64,
}

impl SegmentAllocator {
    pub fn new(
        authority: Arc<dyn Authority>,
        clock: Arc<dyn TimeSource>,
        config: SegmentConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                authority,
                clock,
                config,
                leases: Mutex::new(HashMap::new()),
                cancel: parent.child_token(),
                closed: AtomicBool::new(false),
                renewals: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the routine that drops expired leases.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("sweep", allocator = NAME);
        *worker = Some(tokio::spawn(sweep_loop(inner).instrument(span)));
    }

    /// Reserves `row_count` row slots for the given key, renewing the cached
    /// lease if it has expired or lacks capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::LeaseExhausted`] if even a fresh lease is too small.
    /// - [`Error::LeaseExpired`] if the authority grants an already expired
    ///   lease.
    /// - [`Error::AdmissionDenied`] if the authority refuses the lease.
    /// - [`Error::AllocatorUnavailable`] if the authority stays unreachable.
    pub async fn assign_segment(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        channel: &str,
        row_count: u64,
    ) -> Result<SegmentAssignment> {
        if row_count == 0 {
            return Err(Error::invalid("cannot assign zero rows"));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }

        let key = SegmentKey {
            collection_id,
            partition_id,
            channel: channel.to_string(),
        };
        let slot = Arc::clone(self.inner.leases.lock().entry(key.clone()).or_default());

        let mut lease = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return Err(Error::ServiceShutdown),
            guard = slot.lock() => guard,
        };

        let now = self.inner.clock.now();
        let usable = lease
            .as_ref()
            .is_some_and(|l| l.is_live(now) && l.capacity_remaining >= row_count);
        if !usable {
            if let Some(stale) = lease.as_ref() {
                tracing::debug!(
                    segment_id = stale.segment_id,
                    left = stale.capacity_remaining,
                    expired = stale.expires_at <= now,
                    "Renewing segment lease"
                );
            }
            let fresh = self.inner.renew(&key, row_count).await?;
            if fresh.capacity_remaining < row_count {
                return Err(Error::LeaseExhausted {
                    segment_id: fresh.segment_id,
                    requested: row_count,
                    granted: fresh.capacity_remaining,
                });
            }
            if !fresh.is_live(self.inner.clock.now()) {
                return Err(Error::LeaseExpired {
                    segment_id: fresh.segment_id,
                });
            }
            *lease = Some(fresh);
        }

        let Some(current) = lease.as_mut() else {
            return Err(Error::ServiceShutdown);
        };
        let assignment = SegmentAssignment {
            segment_id: current.segment_id,
            key,
            row_offset: current.row_offset,
            row_count,
            expires_at: current.expires_at,
        };
        current.row_offset += row_count;
        current.capacity_remaining -= row_count;
        Ok(assignment)
    }

    /// Drops expired leases not currently in use, returning how many were
    /// dropped.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Keys with a cached lease slot.
    pub fn cached_leases(&self) -> usize {
        self.inner.leases.lock().len()
    }

    /// Leases requested from the authority since creation.
    pub fn renewals(&self) -> u64 {
        self.inner.renewals.load(Ordering::Relaxed)
    }

    /// Stops the sweep routine and forgets every lease. Unused capacity is
    /// reclaimed by the authority when the leases expire.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!(allocator = NAME, "Sweep routine panicked: {e}");
            }
        }

        let released = {
            let mut leases = self.inner.leases.lock();
            let released = leases.len();
            leases.clear();
            released
        };
        tracing::info!(allocator = NAME, released, "Allocator closed");
    }
}

impl Inner {
    async fn renew(&self, key: &SegmentKey, row_count: u64) -> Result<SegmentLease> {
        let request = SegmentRequest {
            key: key.clone(),
            row_count,
        };
        let lease = with_backoff(NAME, &self.config.retry, &self.cancel, || {
            self.authority.assign_segment(request.clone())
        })
        .await?;
        self.renewals.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            segment_id = lease.segment_id,
            collection_id = key.collection_id,
            channel = %key.channel,
            capacity = lease.capacity_remaining,
            "Leased segment"
        );
        Ok(lease)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, slot| {
            // Requests clone the slot under the map lock; a slot held
            // anywhere else stays until its holders are done with it.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(lease) => lease.as_ref().is_some_and(|l| l.is_live(now)),
                Err(_) => true,
            }
        });
        before - leases.len()
    }
}


async fn sweep_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let dropped = inner.sweep();
        if dropped > 0 {
            tracing::debug!(dropped, "Swept expired segment leases");
        }
    }
}
