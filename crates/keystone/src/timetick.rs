//! Periodic time-tick publication.
//!
//! A tick promises downstream consumers of the manipulation channels that no
//! record with a smaller timestamp will follow. Ticks only move forward.

use crate::{
    bus::{Producer, encode},
    error::Result,
    scheduler::TaskScheduler,
    types::Timestamp,
};
use core::time::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTick {
    pub timestamp: Timestamp,
}

pub struct TimeTicker {
    scheduler: Arc<TaskScheduler>,
    producer: Arc<dyn Producer>,
    interval: Duration,
    cancel: CancellationToken,
    last: Arc<Mutex<Timestamp>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeTicker {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        producer: Arc<dyn Producer>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            producer,
            interval,
            cancel: parent.child_token(),
            last: Arc::new(Mutex::new(Timestamp::ZERO)),
            worker: Mutex::new(None),
        }
    }

    pub fn last(&self) -> Timestamp {
        *self.last.lock()
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let scheduler = Arc::clone(&self.scheduler);
        let producer = Arc::clone(&self.producer);
        let last = Arc::clone(&self.last);
        let cancel = self.cancel.clone();
        let interval = self.interval;

        let routine = async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = tick_once(&scheduler, producer.as_ref(), &last).await {
                    tracing::warn!("Time tick failed: {e}");
                }
            }
            tracing::trace!("Time tick routine exited");
        };
        *worker = Some(tokio::spawn(routine.instrument(tracing::info_span!("timetick"))));
        tracing::info!(?interval, "Time tick started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!("Time tick routine panicked: {e}");
            }
        }
        tracing::info!(last = %self.last(), "Time tick stopped");
    }
}

/// Publishes one tick if it advances past the previous one.
async fn tick_once(
    scheduler: &TaskScheduler,
    producer: &dyn Producer,
    last: &Mutex<Timestamp>,
) -> Result<Option<Timestamp>> {
    let timestamp = scheduler.safe_timestamp().await?;
    if timestamp <= *last.lock() {
        return Ok(None);
    }
    producer
        .publish(timestamp, encode(&TimeTick { timestamp })?)
        .await?;
    let mut last = last.lock();
    if timestamp > *last {
        *last = timestamp;
    }
    tracing::trace!(%timestamp, "Published time tick");
    Ok(Some(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::{IdAllocator, TimestampAllocator},
        authority::{Authority, LocalAuthority},
        bus::{InMemoryBus, MessageBus},
        config::{AllocatorConfig, BusConfig, SchedulerConfig},
    };

    async fn ticker(bus: &InMemoryBus) -> TimeTicker {
        let authority: Arc<dyn Authority> = Arc::new(LocalAuthority::default());
        let cancel = CancellationToken::new();
        let ids = Arc::new(IdAllocator::new(
            Arc::clone(&authority),
            AllocatorConfig::default(),
            &cancel,
        ));
        let timestamps = Arc::new(TimestampAllocator::new(
            authority,
            AllocatorConfig::default(),
            &cancel,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            ids,
            timestamps,
            &cancel,
        ));
        let producer = bus
            .create_producer(BusConfig::TIMETICK_CHANNEL)
            .await
            .unwrap();
        TimeTicker::new(scheduler, producer, Duration::from_millis(10), &cancel)
    }

    #[tokio::test]
    async fn ticks_strictly_increase() {
        let bus = InMemoryBus::new();
        let ticker = ticker(&bus).await;
        ticker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ticker.stop().await;

        let ticks: Vec<TimeTick> = bus
            .messages(BusConfig::TIMETICK_CHANNEL)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        assert!(ticks.len() >= 2);
        assert!(ticks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(ticks.last().map(|t| t.timestamp), Some(ticker.last()));
    }

    #[tokio::test]
    async fn stopped_ticker_publishes_nothing_more() {
        let bus = InMemoryBus::new();
        let ticker = ticker(&bus).await;
        ticker.start();
        ticker.stop().await;
        let published = bus.messages(BusConfig::TIMETICK_CHANNEL).len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.messages(BusConfig::TIMETICK_CHANNEL).len(), published);
    }
}
