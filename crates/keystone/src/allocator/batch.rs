use super::{AllocationRange, with_backoff};
use crate::{
    config::AllocatorConfig,
    error::{Error, Result},
};
use core::future::Future;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Refills allowed per request before giving up on short grants.
const MAX_SHORT_GRANTS: u32 = 3;

/// Where a [`BatchAllocator`] leases its ranges from.
pub trait RangeSource: Send + Sync + 'static {
    /// Name used in logs and in [`Error::AllocatorUnavailable`].
    const NAME: &'static str;

    /// Hard cap on one lease, regardless of configuration.
    const MAX_BATCH: u32;

    /// Whether cached values lose their meaning while the allocator sits
    /// idle. Timestamp ranges do: a stale cached timestamp would order a new
    /// operation before ones other nodes already issued.
    const EXPIRES_WHEN_IDLE: bool;

    /// Leases up to `count` consecutive values.
    fn fetch(&self, count: u32) -> impl Future<Output = Result<AllocationRange>> + Send;
}

/// Generic batch-leasing allocator.
///
/// Callers take values from cached ranges under a short lock. When the cache
/// cannot satisfy a request the caller refills it synchronously; otherwise a
/// background routine tops it up whenever it drops below the low-water mark.
/// All authority calls go through one refill lock, so ranges are installed
/// in the order the authority granted them and handed-out values only grow.
pub struct BatchAllocator<S: RangeSource> {
    inner: Arc<Inner<S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<S> {
    source: S,
    config: AllocatorConfig,
    max_batch: u32,
    state: Mutex<State>,
    refill_lock: tokio::sync::Mutex<()>,
    low_water: Notify,
    cancel: CancellationToken,
    refills: AtomicU64,
}

struct State {
    ranges: VecDeque<AllocationRange>,
    batch: u32,
    /// End of the newest installed range. Nothing below it is ever cached
    /// again.
    high_water: u64,
    last_refill: Option<Instant>,
    last_allocation: Instant,
    last_shrink: Instant,
    closed: bool,
}

impl State {
    fn remaining(&self) -> u64 {
        self.ranges.iter().map(AllocationRange::len).sum()
    }

    fn low_water_mark(&self) -> u64 {
        u64::from(self.batch / 2)
    }

    fn discard_all(&mut self) -> u64 {
        let discarded = self.remaining();
        self.ranges.clear();
        discarded
    }
}

impl<S: RangeSource> BatchAllocator<S> {
    /// Creates an idle allocator. `parent` cancels it along with the rest of
    /// the core.
    pub fn new(source: S, config: AllocatorConfig, parent: &CancellationToken) -> Self {
        let max_batch = config.max_batch.min(S::MAX_BATCH).max(1);
        let min_batch = config.min_batch.clamp(1, max_batch);
        let batch = config.initial_batch.clamp(min_batch, max_batch);
        let now = Instant::now();

        Self {
            inner: Arc::new(Inner {
                source,
                config: AllocatorConfig {
                    min_batch,
                    ..config
                },
                max_batch,
                state: Mutex::new(State {
                    ranges: VecDeque::new(),
                    batch,
                    high_water: 0,
                    last_refill: None,
                    last_allocation: now,
                    last_shrink: now,
                    closed: false,
                }),
                refill_lock: tokio::sync::Mutex::new(()),
                low_water: Notify::new(),
                cancel: parent.child_token(),
                refills: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the background refill routine. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("refill", allocator = S::NAME);
        *worker = Some(tokio::spawn(refill_loop(inner).instrument(span)));
        tracing::debug!(allocator = S::NAME, "Allocator started");
    }

    /// Takes `n` consecutive values.
    ///
    /// # Errors
    ///
    /// - [`Error::ValidationFailed`] if `n` is zero or above the batch cap.
    /// - [`Error::ServiceShutdown`] once the allocator is closed.
    /// - [`Error::AllocatorUnavailable`] if the authority stays unreachable.
    pub async fn allocate(&self, n: u32) -> Result<AllocationRange> {
        if n == 0 {
            return Err(Error::invalid("cannot allocate zero values"));
        }
        if n > self.inner.max_batch {
            return Err(Error::invalid(format!(
                "{} allocation of {n} exceeds the batch cap of {}",
                S::NAME,
                self.inner.max_batch
            )));
        }

        let mut refills = 0;
        loop {
            if let Some(range) = self.inner.try_take(n)? {
                return Ok(range);
            }
            if refills == MAX_SHORT_GRANTS {
                return Err(Error::AllocatorUnavailable {
                    allocator: S::NAME,
                    attempts: refills,
                    reason: format!("authority kept granting fewer than {n} values"),
                });
            }
            refills += 1;
            self.inner.refill(n).await?;
        }
    }

    /// Stops the refill routine and releases cached ranges. Released values
    /// are never reissued; the authority has already moved past them.
    pub async fn close(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.discard_all()
        };
        self.inner.cancel.cancel();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!(allocator = S::NAME, "Refill routine panicked: {e}");
            }
        }
        tracing::info!(allocator = S::NAME, discarded, "Allocator closed");
    }

    /// Values cached locally.
    pub fn remaining(&self) -> u64 {
        self.inner.state.lock().remaining()
    }

    /// Current lease size.
    pub fn batch_size(&self) -> u32 {
        self.inner.state.lock().batch
    }

    /// Ranges installed since creation.
    pub fn refills(&self) -> u64 {
        self.inner.refills.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<S: RangeSource> Inner<S> {
    fn try_take(&self, n: u32) -> Result<Option<AllocationRange>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ServiceShutdown);
        }
        state.last_allocation = Instant::now();

        let n = u64::from(n);
        while let Some(front) = state.ranges.front_mut() {
            if front.len() >= n {
                let taken = front.take_front(n);
                if front.is_empty() {
                    state.ranges.pop_front();
                }
                if state.remaining() < state.low_water_mark() {
                    self.low_water.notify_one();
                }
                return Ok(Some(taken));
            }
            // A request never spans two ranges; the tail of a short range is
            // skipped so that values stay in order.
            if let Some(wasted) = state.ranges.pop_front() {
                tracing::trace!(allocator = S::NAME, wasted = wasted.len(), "Skipped short range");
            }
        }
        Ok(None)
    }

    /// Leases a new range. With `min > 0` the refill serves a waiting caller
    /// and is skipped if another caller already installed enough; with
    /// `min == 0` it is a background top-up.
    async fn refill(&self, min: u32) -> Result<()> {
        let _guard = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::ServiceShutdown),
            guard = self.refill_lock.lock() => guard,
        };

        let count = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::ServiceShutdown);
            }
            if min > 0 {
                if state.ranges.iter().any(|r| r.len() >= u64::from(min)) {
                    return Ok(());
                }
            } else if state.remaining() >= state.low_water_mark() {
                return Ok(());
            }
            state.batch.max(min)
        };

        let range = with_backoff(S::NAME, &self.config.retry, &self.cancel, || {
            self.source.fetch(count)
        })
        .await?;
        self.install(range);
        Ok(())
    }

    fn install(&self, mut range: AllocationRange) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if range.start < state.high_water {
            tracing::warn!(
                allocator = S::NAME,
                start = range.start,
                high_water = state.high_water,
                "Authority granted values below the high-water mark; trimming"
            );
            range.start = state.high_water.min(range.end);
        }
        if !range.is_empty() {
            state.high_water = range.end;
            state.ranges.push_back(range);
        }

        let now = Instant::now();
        if let Some(last) = state.last_refill {
            if now.duration_since(last) < self.config.grow_window && state.batch < self.max_batch {
                state.batch = state.batch.saturating_mul(2).min(self.max_batch);
                tracing::debug!(allocator = S::NAME, batch = state.batch, "Grew batch size");
            }
        }
        state.last_refill = Some(now);
        self.refills.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            allocator = S::NAME,
            start = range.start,
            end = range.end,
            cached = state.remaining(),
            "Installed range"
        );
    }

    /// One pass of the background routine: shrink when idle, otherwise top
    /// up below the low-water mark.
    async fn maintain(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout;
            let idle = now.duration_since(state.last_allocation) >= idle_timeout;
            if idle && now.duration_since(state.last_shrink) >= idle_timeout {
                state.last_shrink = now;
                if state.batch > self.config.min_batch {
                    state.batch = (state.batch / 2).max(self.config.min_batch);
                    tracing::debug!(allocator = S::NAME, batch = state.batch, "Shrank batch size");
                }
                if S::EXPIRES_WHEN_IDLE {
                    let discarded = state.discard_all();
                    if discarded > 0 {
                        tracing::debug!(allocator = S::NAME, discarded, "Dropped stale range");
                    }
                }
            }
            // Idle allocators refill on the next request instead.
            if idle || state.remaining() >= state.low_water_mark() {
                return;
            }
        }

        match self.refill(0).await {
            Ok(()) | Err(Error::ServiceShutdown) => {}
            Err(e) => tracing::warn!("Background refill failed: {e}"),
        }
    }
}

async fn refill_loop<S: RangeSource>(inner: Arc<Inner<S>>) {
    let mut ticker = tokio::time::interval(inner.config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            () = inner.low_water.notified() => {}
            _ = ticker.tick() => {}
        }
        inner.maintain().await;
    }
    tracing::trace!("Refill routine exited");
}
