//! Concrete tasks.
//!
//! - [`DdlTask`] applies a [`SchemaChange`] through the authority.
//! - [`InsertTask`] / [`DeleteTask`] publish manipulation records.
//! - [`SearchTask`] dispatches a search to the query channel.
//!
//! Every task holds an [`Arc<Services>`] with the components it needs.
//!
//! [`SchemaChange`]: crate::authority::SchemaChange

mod ddl;
mod dml;
mod query;

pub use ddl::DdlTask;
pub use dml::{DeleteRequest, DeleteTask, InsertRequest, InsertTask};
pub use query::{SearchRequest, SearchTask};

use crate::{
    allocator::{IdAllocator, SegmentAllocator},
    authority::{Authority, CollectionInfo},
    bus::Producers,
    config::BusConfig,
    error::{Error, Result},
    meta::MetaCache,
    schema::{DEFAULT_PARTITION, Row},
    types::{Timestamp, UniqueId},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What tasks reach while executing. Built by the coordinator once every
/// component has started.
pub struct Services {
    pub authority: Arc<dyn Authority>,
    pub ids: Arc<IdAllocator>,
    pub segments: Arc<SegmentAllocator>,
    pub meta: Arc<MetaCache>,
    pub producers: Arc<Producers>,
    pub bus: BusConfig,
}

/// Payload published on a manipulation channel for an insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertRecord {
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub segment_id: UniqueId,
    pub row_offset: u64,
    pub first_row_id: UniqueId,
    pub timestamp: Timestamp,
    pub rows: Vec<Row>,
}

/// Payload published on a manipulation channel for a delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteRecord {
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub segment_id: UniqueId,
    pub timestamp: Timestamp,
    pub primary_keys: Vec<i64>,
}

/// Payload published on the query channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub request_id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_ids: Vec<UniqueId>,
    pub field: String,
    pub vectors: Vec<Vec<f32>>,
    pub top_k: u32,
    pub timestamp: Timestamp,
}

/// Resolves a partition name, defaulting to the default partition.
fn partition_id(info: &CollectionInfo, partition: Option<&str>) -> Result<UniqueId> {
    let name = partition.unwrap_or(DEFAULT_PARTITION);
    info.partitions.get(name).copied().ok_or_else(|| {
        Error::invalid(format!(
            "partition {name} does not exist in collection {}",
            info.schema.name
        ))
    })
}

/// The plan a task builds in `pre_execute`; missing only if the scheduler
/// skipped that phase.
fn planned<T>(plan: Option<&T>) -> Result<&T> {
    plan.ok_or(Error::NotStarted {
        component: "task plan",
    })
}
