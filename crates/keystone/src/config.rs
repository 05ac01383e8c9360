//! Tunables for the gateway core.
//!
//! Every struct has a `Default` suitable for a single node; the server binary
//! overrides fields from its command line. The adaptive batch policy works as
//! follows:
//!
//! - **Growth**: two refills within `grow_window` double the batch size, up
//!   to `max_batch`.
//! - **Shrink**: `idle_timeout` without allocations halves it, down to
//!   `min_batch`.
//! - **Low water**: the background routine refills once fewer than half a
//!   batch of values remain cached.

use crate::allocator::RetryPolicy;
use core::time::Duration;

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub initial_batch: u32,
    pub min_batch: u32,
    pub max_batch: u32,
    pub grow_window: Duration,
    pub idle_timeout: Duration,
    /// How often the background routine checks the low-water mark even
    /// without being woken.
    pub check_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            initial_batch: 256,
            min_batch: 16,
            max_batch: 65_536,
            grow_window: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            check_interval: Duration::from_millis(50),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SegmentConfig {
    /// How often expired leases are dropped from the cache.
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Worker loops, and therefore tasks executing at once, for this queue.
    pub max_active: usize,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub ddl: QueueConfig,
    pub manipulation: QueueConfig,
    pub query: QueueConfig,
    /// How long a worker waits for a collection exclusion token before
    /// putting the task back in its queue.
    pub exclusion_wait: Duration,
    /// Re-queues allowed before a task fails with `ExclusionTimeout`.
    pub max_requeues: u32,
    /// Attempts of `Execute` on transient failure.
    pub execute_attempts: u32,
    pub execute_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ddl: QueueConfig { max_active: 1 },
            manipulation: QueueConfig { max_active: 8 },
            query: QueueConfig { max_active: 8 },
            exclusion_wait: Duration::from_secs(3),
            max_requeues: 5,
            execute_attempts: 3,
            execute_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Number of `manipulation-{i}` channels collections are spread over.
    pub manipulation_channels: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            manipulation_channels: 1,
        }
    }
}

impl BusConfig {
    pub const QUERY_CHANNEL: &'static str = "query";
    pub const TIMETICK_CHANNEL: &'static str = "timetick";

    /// The manipulation channel a collection's mutations are published on.
    pub fn manipulation_channel(&self, collection_id: u64) -> String {
        let shards = u64::from(self.manipulation_channels.max(1));
        format!("manipulation-{}", collection_id % shards)
    }

    pub fn manipulation_channel_names(&self) -> Vec<String> {
        (0..self.manipulation_channels.max(1))
            .map(|i| format!("manipulation-{i}"))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub id_allocator: AllocatorConfig,
    pub timestamp_allocator: AllocatorConfig,
    pub segment: SegmentConfig,
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
    pub time_tick_interval: Duration,
    /// Time in-flight tasks get to finish before shutdown cancels them.
    pub shutdown_grace: Duration,
    /// Default deadline a caller waits for a task's terminal state.
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            id_allocator: AllocatorConfig::default(),
            timestamp_allocator: AllocatorConfig {
                // A timestamp batch cannot span more than one millisecond of
                // logical counter.
                max_batch: 1 << 18,
                ..AllocatorConfig::default()
            },
            segment: SegmentConfig::default(),
            scheduler: SchedulerConfig::default(),
            bus: BusConfig::default(),
            time_tick_interval: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_spread_over_manipulation_channels() {
        let bus = BusConfig {
            manipulation_channels: 4,
        };
        assert_eq!(bus.manipulation_channel(9), "manipulation-1");
        assert_eq!(bus.manipulation_channel_names().len(), 4);
    }

    #[test]
    fn zero_channels_fall_back_to_one() {
        let bus = BusConfig {
            manipulation_channels: 0,
        };
        assert_eq!(bus.manipulation_channel(9), "manipulation-0");
    }
}
