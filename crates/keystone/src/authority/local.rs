//! In-process authority.
//!
//! [`LocalAuthority`] keeps the allocation high-water marks and collection
//! metadata in an [`AuthorityState`] that can outlive any one client, which
//! is how restart behavior is exercised: drop the allocators, keep the state,
//! build new allocators on a fresh `LocalAuthority` over the same state.

use super::{
    Authority, AuthorityConnector, CollectionInfo, SchemaAck, SchemaChange, SegmentKey,
    SegmentLease, SegmentRequest,
};
use crate::{
    allocator::AllocationRange,
    error::{Error, Result},
    schema::DEFAULT_PARTITION,
    types::{SystemClock, TimeSource, Timestamp, UniqueId},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};
use tonic::Code;

#[derive(Clone, Debug)]
pub struct LocalAuthorityConfig {
    /// Rows a segment holds before it is sealed.
    pub segment_capacity: u64,
    /// Rows granted per lease unless the request asks for more.
    pub lease_rows: u64,
    pub lease_ttl: Duration,
    /// Admission limit on rows leased per collection.
    pub max_rows_per_collection: Option<u64>,
}

impl Default for LocalAuthorityConfig {
    fn default() -> Self {
        Self {
            segment_capacity: 1 << 20,
            lease_rows: 10_000,
            lease_ttl: Duration::from_secs(10),
            max_rows_per_collection: None,
        }
    }
}

#[derive(Debug)]
struct OpenSegment {
    segment_id: UniqueId,
    next_slot: u64,
    remaining: u64,
}

/// Durable authority bookkeeping.
#[derive(Debug)]
pub struct AuthorityState {
    next_id: u64,
    last_timestamp: Timestamp,
    collections: BTreeMap<String, CollectionInfo>,
    segments: HashMap<SegmentKey, OpenSegment>,
    leased_rows: HashMap<UniqueId, u64>,
}

impl Default for AuthorityState {
    fn default() -> Self {
        Self {
            // Zero is never a valid identifier.
            next_id: 1,
            last_timestamp: Timestamp::ZERO,
            collections: BTreeMap::new(),
            segments: HashMap::new(),
            leased_rows: HashMap::new(),
        }
    }
}

impl AuthorityState {
    fn next_id(&mut self) -> UniqueId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Highest timestamp ever issued.
    pub fn timestamp_high_water(&self) -> Timestamp {
        self.last_timestamp
    }

    /// First identifier not yet issued.
    pub fn id_high_water(&self) -> u64 {
        self.next_id
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    ids: AtomicU64,
    timestamps: AtomicU64,
    segments: AtomicU64,
    schema: AtomicU64,
}

/// An [`Authority`] living in the same process.
#[derive(Clone)]
pub struct LocalAuthority {
    state: Arc<Mutex<AuthorityState>>,
    clock: Arc<dyn TimeSource>,
    config: LocalAuthorityConfig,
    calls: Arc<CallCounters>,
    failures: Arc<AtomicU32>,
    latency: Arc<AtomicU64>,
}

impl Default for LocalAuthority {
    fn default() -> Self {
        Self::new(LocalAuthorityConfig::default())
    }
}

impl LocalAuthority {
    pub fn new(config: LocalAuthorityConfig) -> Self {
        Self::with_parts(
            Arc::new(Mutex::new(AuthorityState::default())),
            Arc::new(SystemClock),
            config,
        )
    }

    /// Builds an authority over existing state and a custom clock.
    pub fn with_parts(
        state: Arc<Mutex<AuthorityState>>,
        clock: Arc<dyn TimeSource>,
        config: LocalAuthorityConfig,
    ) -> Self {
        Self {
            state,
            clock,
            config,
            calls: Arc::default(),
            failures: Arc::default(),
            latency: Arc::default(),
        }
    }

    /// Shared state, to hand to an authority built after a simulated
    /// restart.
    pub fn state(&self) -> Arc<Mutex<AuthorityState>> {
        Arc::clone(&self.state)
    }

    /// Makes the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Adds an artificial delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn id_calls(&self) -> u64 {
        self.calls.ids.load(Ordering::SeqCst)
    }

    pub fn timestamp_calls(&self) -> u64 {
        self.calls.timestamps.load(Ordering::SeqCst)
    }

    pub fn segment_calls(&self) -> u64 {
        self.calls.segments.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> u64 {
        self.calls.schema.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicU64) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Authority {
                code: Code::Unavailable,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn not_found(what: &str, name: &str) -> Error {
    Error::Authority {
        code: Code::NotFound,
        message: format!("{what} {name} not found"),
    }
}

fn already_exists(what: &str, name: &str) -> Error {
    Error::Authority {
        code: Code::AlreadyExists,
        message: format!("{what} {name} already exists"),
    }
}

#[tonic::async_trait]
impl Authority for LocalAuthority {
    async fn allocate_ids(&self, count: u32) -> Result<AllocationRange> {
        self.enter(&self.calls.ids).await?;
        let mut state = self.state.lock();
        let start = state.next_id;
        state.next_id += u64::from(count);
        Ok(AllocationRange::new(start, state.next_id, count))
    }

    async fn allocate_timestamps(&self, count: u32) -> Result<AllocationRange> {
        self.enter(&self.calls.timestamps).await?;
        let mut state = self.state.lock();
        let last = state.last_timestamp;
        let mut physical = self.clock.current_millis().max(last.physical());
        let mut logical = if physical == last.physical() {
            last.logical() + 1
        } else {
            0
        };
        if logical > Timestamp::LOGICAL_MASK {
            physical += 1;
            logical = 0;
        }

        let available = Timestamp::LOGICAL_MASK + 1 - logical;
        let granted = u64::from(count).min(available);
        let start = Timestamp::compose(physical, logical).to_raw();
        let end = start + granted;
        state.last_timestamp = Timestamp::from_raw(end - 1);
        Ok(AllocationRange::new(start, end, count))
    }

    async fn assign_segment(&self, request: SegmentRequest) -> Result<SegmentLease> {
        self.enter(&self.calls.segments).await?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let known = state
            .collections
            .values()
            .any(|c| c.id == request.key.collection_id);
        if !known {
            return Err(not_found(
                "collection id",
                &request.key.collection_id.to_string(),
            ));
        }

        let leased = state
            .leased_rows
            .get(&request.key.collection_id)
            .copied()
            .unwrap_or(0);
        if let Some(limit) = self.config.max_rows_per_collection {
            if leased + request.row_count > limit {
                return Err(Error::AdmissionDenied {
                    reason: format!(
                        "collection {} is at capacity ({leased}/{limit} rows)",
                        request.key.collection_id
                    ),
                });
            }
        }

        let wanted = request.row_count.max(self.config.lease_rows);
        let reopen = match state.segments.get(&request.key) {
            None => true,
            // Seal a partly used segment that cannot take the request whole.
            Some(open) => open.remaining < request.row_count.min(self.config.segment_capacity),
        };
        if reopen {
            let segment_id = state.next_id();
            state.segments.insert(
                request.key.clone(),
                OpenSegment {
                    segment_id,
                    next_slot: 0,
                    remaining: self.config.segment_capacity,
                },
            );
        }

        let (segment_id, row_offset, granted) = {
            let open = state
                .segments
                .get_mut(&request.key)
                .ok_or_else(|| not_found("segment for", &request.key.channel))?;
            let granted = wanted.min(open.remaining);
            let offset = open.next_slot;
            open.next_slot += granted;
            open.remaining -= granted;
            (open.segment_id, offset, granted)
        };
        *state
            .leased_rows
            .entry(request.key.collection_id)
            .or_insert(0) += granted;

        Ok(SegmentLease {
            segment_id,
            key: request.key,
            row_offset,
            capacity_remaining: granted,
            expires_at: now.add_millis(self.config.lease_ttl.as_millis() as u64),
        })
    }

    async fn apply_schema_change(&self, change: SchemaChange) -> Result<SchemaAck> {
        self.enter(&self.calls.schema).await?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        match change {
            SchemaChange::CreateCollection { schema } => {
                schema.validate()?;
                if state.collections.contains_key(&schema.name) {
                    return Err(already_exists("collection", &schema.name));
                }
                let id = state.next_id();
                let default_partition = state.next_id();
                let name = schema.name.clone();
                state.collections.insert(
                    name.clone(),
                    CollectionInfo {
                        id,
                        schema,
                        partitions: BTreeMap::from([(
                            DEFAULT_PARTITION.to_string(),
                            default_partition,
                        )]),
                        created_at: now,
                    },
                );
                Ok(SchemaAck {
                    collection: name,
                    collection_id: id,
                })
            }
            SchemaChange::DropCollection { collection } => {
                let info = state
                    .collections
                    .remove(&collection)
                    .ok_or_else(|| not_found("collection", &collection))?;
                state.segments.retain(|key, _| key.collection_id != info.id);
                state.leased_rows.remove(&info.id);
                Ok(SchemaAck {
                    collection,
                    collection_id: info.id,
                })
            }
            SchemaChange::CreatePartition {
                collection,
                partition,
            } => {
                let partition_id = state.next_id();
                let info = state
                    .collections
                    .get_mut(&collection)
                    .ok_or_else(|| not_found("collection", &collection))?;
                if info.partitions.contains_key(&partition) {
                    return Err(already_exists("partition", &partition));
                }
                info.partitions.insert(partition, partition_id);
                Ok(SchemaAck {
                    collection,
                    collection_id: info.id,
                })
            }
            SchemaChange::DropPartition {
                collection,
                partition,
            } => {
                if partition == DEFAULT_PARTITION {
                    return Err(Error::Authority {
                        code: Code::InvalidArgument,
                        message: "the default partition cannot be dropped".to_string(),
                    });
                }
                let info = state
                    .collections
                    .get_mut(&collection)
                    .ok_or_else(|| not_found("collection", &collection))?;
                let partition_id = info
                    .partitions
                    .remove(&partition)
                    .ok_or_else(|| not_found("partition", &partition))?;
                let collection_id = info.id;
                state.segments.retain(|key, _| {
                    key.collection_id != collection_id || key.partition_id != partition_id
                });
                Ok(SchemaAck {
                    collection,
                    collection_id,
                })
            }
        }
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        self.enter(&self.calls.schema).await?;
        self.state
            .lock()
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("collection", name))
    }

    async fn show_collections(&self) -> Result<Vec<String>> {
        self.enter(&self.calls.schema).await?;
        Ok(self.state.lock().collections.keys().cloned().collect())
    }
}

#[tonic::async_trait]
impl AuthorityConnector for LocalAuthority {
    async fn connect(&self) -> Result<Arc<dyn Authority>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{CollectionSchema, DataType, FieldSchema},
        types::ManualClock,
    };

    fn authority(clock: ManualClock) -> LocalAuthority {
        LocalAuthority::with_parts(
            Arc::default(),
            Arc::new(clock),
            LocalAuthorityConfig::default(),
        )
    }

    #[tokio::test]
    async fn timestamp_ranges_never_cross_a_millisecond() {
        let clock = ManualClock::new(1_000);
        let authority = authority(clock);

        let first = authority
            .allocate_timestamps(Timestamp::LOGICAL_MASK as u32)
            .await
            .unwrap();
        assert_eq!(Timestamp::from_raw(first.start), Timestamp::compose(1_000, 0));

        // Only one logical slot is left in this millisecond.
        let second = authority.allocate_timestamps(10).await.unwrap();
        assert_eq!(second.len(), 1);

        // The clock has not moved, so the physical part is bumped.
        let third = authority.allocate_timestamps(10).await.unwrap();
        assert_eq!(Timestamp::from_raw(third.start).physical(), 1_001);
        assert!(third.start >= second.end);
    }

    #[tokio::test]
    async fn timestamps_survive_a_clock_going_backwards() {
        let clock = ManualClock::new(5_000);
        let authority = authority(clock.clone());
        let before = authority.allocate_timestamps(4).await.unwrap();
        clock.set(1_000);
        let after = authority.allocate_timestamps(4).await.unwrap();
        assert!(after.start >= before.end);
    }

    #[tokio::test]
    async fn create_collection_assigns_ids_and_default_partition() {
        let authority = LocalAuthority::default();
        let schema = CollectionSchema {
            name: "docs".into(),
            description: String::new(),
            fields: vec![FieldSchema {
                name: "pk".into(),
                data_type: DataType::Int64,
                is_primary: true,
            }],
        };
        let ack = authority
            .apply_schema_change(SchemaChange::CreateCollection {
                schema: schema.clone(),
            })
            .await
            .unwrap();
        let info = authority.describe_collection("docs").await.unwrap();
        assert_eq!(info.id, ack.collection_id);
        assert!(info.partitions.contains_key(DEFAULT_PARTITION));

        let dup = authority
            .apply_schema_change(SchemaChange::CreateCollection { schema })
            .await;
        assert!(matches!(
            dup,
            Err(Error::Authority {
                code: Code::AlreadyExists,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let authority = LocalAuthority::default();
        authority.fail_next(2);
        assert!(authority.allocate_ids(1).await.is_err());
        assert!(authority.allocate_ids(1).await.is_err());
        let range = authority.allocate_ids(3).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(authority.id_calls(), 3);
    }
}
