//! The authority contract.
//!
//! The authority is the cluster's single source of truth for identifiers,
//! timestamps, segment admission and schema. This core only consumes it, as a
//! remote batch-lease service:
//!
//! - [`Authority`] - the RPC surface, shared read-only by every allocator.
//! - [`AuthorityConnector`] - performs the startup dial.
//! - [`LocalAuthority`] - in-process implementation, used for single-node
//!   deployments and as the test double.
//! - [`GrpcAuthority`] - remote implementation over tonic.

mod grpc;
mod local;

pub use grpc::{GrpcAuthority, GrpcConnector};
pub use local::{AuthorityState, LocalAuthority, LocalAuthorityConfig};

use crate::{
    allocator::AllocationRange,
    error::Result,
    schema::CollectionSchema,
    types::{Timestamp, UniqueId},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// Remote allocation and metadata service.
///
/// Every method is stateless from the caller's point of view, so a single
/// connection is shared by all allocators without client-side locking.
#[tonic::async_trait]
pub trait Authority: Send + Sync + 'static {
    /// Leases `count` consecutive identifiers.
    async fn allocate_ids(&self, count: u32) -> Result<AllocationRange>;

    /// Leases `count` consecutive timestamps. The range never crosses a
    /// physical millisecond boundary, so it may hold fewer than `count`.
    async fn allocate_timestamps(&self, count: u32) -> Result<AllocationRange>;

    /// Requests a fresh lease on a segment able to receive `row_count` rows.
    async fn assign_segment(&self, request: SegmentRequest) -> Result<SegmentLease>;

    /// Applies a schema change and acknowledges it.
    async fn apply_schema_change(&self, change: SchemaChange) -> Result<SchemaAck>;

    /// Describes one collection; unknown names yield a `NotFound` error.
    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo>;

    /// Lists every collection name.
    async fn show_collections(&self) -> Result<Vec<String>>;
}

/// Establishes the shared authority connection at startup.
#[tonic::async_trait]
pub trait AuthorityConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Authority>>;
}

/// The tuple a segment lease is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub channel: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRequest {
    pub key: SegmentKey,
    pub row_count: u64,
}

/// A time- and capacity-bounded right to write rows into a segment.
///
/// Rows are addressed by slot: the lease owns slots
/// `row_offset .. row_offset + capacity_remaining`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLease {
    pub segment_id: UniqueId,
    pub key: SegmentKey,
    pub row_offset: u64,
    pub capacity_remaining: u64,
    pub expires_at: Timestamp,
}

impl SegmentLease {
    /// A lease is usable until it expires or runs out of capacity.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.capacity_remaining > 0 && now < self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateCollection { schema: CollectionSchema },
    DropCollection { collection: String },
    CreatePartition { collection: String, partition: String },
    DropPartition { collection: String, partition: String },
}

impl SchemaChange {
    /// The collection this change targets.
    pub fn collection(&self) -> &str {
        match self {
            Self::CreateCollection { schema } => &schema.name,
            Self::DropCollection { collection }
            | Self::CreatePartition { collection, .. }
            | Self::DropPartition { collection, .. } => collection,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Self::CreateCollection { .. } => "create_collection",
            Self::DropCollection { .. } => "drop_collection",
            Self::CreatePartition { .. } => "create_partition",
            Self::DropPartition { .. } => "drop_partition",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaAck {
    pub collection: String,
    pub collection_id: UniqueId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: UniqueId,
    pub schema: CollectionSchema,
    pub partitions: BTreeMap<String, UniqueId>,
    pub created_at: Timestamp,
}
