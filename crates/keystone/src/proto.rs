//! gRPC message definitions for the authority and message-bus services.
//!
//! Messages are declared directly with `prost` derives and called through
//! [`tonic::client::Grpc`] with [`tonic_prost::ProstCodec`], which is what
//! generated stubs do under the hood.
//!
//! ## Services
//!
//! - `keystone.authority.Authority`: `AllocateIds`, `AllocateTimestamps`,
//!   `AssignSegment`, `ApplySchemaChange`, `DescribeCollection`,
//!   `ShowCollections`.
//! - `keystone.bus.MessageBus`: `Publish`.

use crate::{
    authority::{CollectionInfo, SchemaAck, SchemaChange, SegmentKey, SegmentLease},
    error::{Error, Result},
    schema::{CollectionSchema, DataType, FieldSchema},
    types::Timestamp,
};
use core::time::Duration;
use std::collections::BTreeMap;
use tonic::{Status, codegen::http::uri::PathAndQuery, transport::Channel};

pub mod paths {
    pub const ALLOCATE_IDS: &str = "/keystone.authority.Authority/AllocateIds";
    pub const ALLOCATE_TIMESTAMPS: &str = "/keystone.authority.Authority/AllocateTimestamps";
    pub const ASSIGN_SEGMENT: &str = "/keystone.authority.Authority/AssignSegment";
    pub const APPLY_SCHEMA_CHANGE: &str = "/keystone.authority.Authority/ApplySchemaChange";
    pub const DESCRIBE_COLLECTION: &str = "/keystone.authority.Authority/DescribeCollection";
    pub const SHOW_COLLECTIONS: &str = "/keystone.authority.Authority/ShowCollections";
    pub const PUBLISH: &str = "/keystone.bus.MessageBus/Publish";
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct AllocateRequest {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct AllocateResponse {
    #[prost(uint64, tag = "1")]
    pub start: u64,
    #[prost(uint64, tag = "2")]
    pub end: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AssignSegmentRequest {
    #[prost(uint64, tag = "1")]
    pub collection_id: u64,
    #[prost(uint64, tag = "2")]
    pub partition_id: u64,
    #[prost(string, tag = "3")]
    pub channel: String,
    #[prost(uint64, tag = "4")]
    pub row_count: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AssignSegmentResponse {
    #[prost(uint64, tag = "1")]
    pub segment_id: u64,
    #[prost(uint64, tag = "2")]
    pub collection_id: u64,
    #[prost(uint64, tag = "3")]
    pub partition_id: u64,
    #[prost(string, tag = "4")]
    pub channel: String,
    #[prost(uint64, tag = "5")]
    pub row_offset: u64,
    #[prost(uint64, tag = "6")]
    pub capacity: u64,
    #[prost(uint64, tag = "7")]
    pub expires_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FieldType {
    Bool = 0,
    Int64 = 1,
    Float = 2,
    String = 3,
    FloatVector = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FieldSchemaMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "FieldType", tag = "2")]
    pub data_type: i32,
    #[prost(uint32, tag = "3")]
    pub dim: u32,
    #[prost(bool, tag = "4")]
    pub is_primary: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CollectionSchemaMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, repeated, tag = "3")]
    pub fields: Vec<FieldSchemaMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PartitionRef {
    #[prost(string, tag = "1")]
    pub collection: String,
    #[prost(string, tag = "2")]
    pub partition: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SchemaChangeRequest {
    #[prost(oneof = "schema_change_request::Change", tags = "1, 2, 3, 4")]
    pub change: Option<schema_change_request::Change>,
}

pub mod schema_change_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Change {
        #[prost(message, tag = "1")]
        CreateCollection(super::CollectionSchemaMessage),
        #[prost(string, tag = "2")]
        DropCollection(String),
        #[prost(message, tag = "3")]
        CreatePartition(super::PartitionRef),
        #[prost(message, tag = "4")]
        DropPartition(super::PartitionRef),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SchemaChangeResponse {
    #[prost(string, tag = "1")]
    pub collection: String,
    #[prost(uint64, tag = "2")]
    pub collection_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DescribeCollectionRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DescribeCollectionResponse {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, optional, tag = "2")]
    pub schema: Option<CollectionSchemaMessage>,
    #[prost(btree_map = "string, uint64", tag = "3")]
    pub partitions: BTreeMap<String, u64>,
    #[prost(uint64, tag = "4")]
    pub created_at: u64,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ShowCollectionsRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShowCollectionsResponse {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PublishRequest {
    #[prost(string, tag = "1")]
    pub channel: String,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: bytes::Bytes,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PublishResponse {
    #[prost(uint64, tag = "1")]
    pub message_id: u64,
}

/// Issues one unary call on a shared channel with a per-call deadline.
///
/// The deadline travels as the `grpc-timeout` header so the server can give
/// up too.
pub(crate) async fn unary<Req, Resp>(
    channel: &Channel,
    path: &'static str,
    message: Req,
    timeout: Duration,
) -> core::result::Result<Resp, Status>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel.clone());
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("Service was not ready: {e}")))?;

    let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
    let mut request = tonic::Request::new(message);
    request.set_timeout(timeout);
    let response = grpc
        .unary(request, PathAndQuery::from_static(path), codec)
        .await?;
    Ok(response.into_inner())
}

impl From<&FieldSchema> for FieldSchemaMessage {
    fn from(field: &FieldSchema) -> Self {
        let (data_type, dim) = match field.data_type {
            DataType::Bool => (FieldType::Bool, 0),
            DataType::Int64 => (FieldType::Int64, 0),
            DataType::Float => (FieldType::Float, 0),
            DataType::String => (FieldType::String, 0),
            DataType::FloatVector { dim } => (FieldType::FloatVector, dim),
        };
        Self {
            name: field.name.clone(),
            data_type: data_type as i32,
            dim,
            is_primary: field.is_primary,
        }
    }
}

impl TryFrom<FieldSchemaMessage> for FieldSchema {
    type Error = Error;

    fn try_from(message: FieldSchemaMessage) -> Result<Self> {
        let kind = FieldType::try_from(message.data_type).map_err(|_| Error::Authority {
            code: tonic::Code::Internal,
            message: format!("unknown field type {}", message.data_type),
        })?;
        let data_type = match kind {
            FieldType::Bool => DataType::Bool,
            FieldType::Int64 => DataType::Int64,
            FieldType::Float => DataType::Float,
            FieldType::String => DataType::String,
            FieldType::FloatVector => DataType::FloatVector { dim: message.dim },
        };
        Ok(Self {
            name: message.name,
            data_type,
            is_primary: message.is_primary,
        })
    }
}

impl From<&CollectionSchema> for CollectionSchemaMessage {
    fn from(schema: &CollectionSchema) -> Self {
        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            fields: schema.fields.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<CollectionSchemaMessage> for CollectionSchema {
    type Error = Error;

    fn try_from(message: CollectionSchemaMessage) -> Result<Self> {
        Ok(Self {
            name: message.name,
            description: message.description,
            fields: message
                .fields
                .into_iter()
                .map(FieldSchema::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

impl From<&SchemaChange> for SchemaChangeRequest {
    fn from(change: &SchemaChange) -> Self {
        use schema_change_request::Change;
        let change = match change {
            SchemaChange::CreateCollection { schema } => Change::CreateCollection(schema.into()),
            SchemaChange::DropCollection { collection } => {
                Change::DropCollection(collection.clone())
            }
            SchemaChange::CreatePartition {
                collection,
                partition,
            } => Change::CreatePartition(PartitionRef {
                collection: collection.clone(),
                partition: partition.clone(),
            }),
            SchemaChange::DropPartition {
                collection,
                partition,
            } => Change::DropPartition(PartitionRef {
                collection: collection.clone(),
                partition: partition.clone(),
            }),
        };
        Self {
            change: Some(change),
        }
    }
}

impl From<SchemaChangeResponse> for SchemaAck {
    fn from(message: SchemaChangeResponse) -> Self {
        Self {
            collection: message.collection,
            collection_id: message.collection_id,
        }
    }
}

impl TryFrom<DescribeCollectionResponse> for CollectionInfo {
    type Error = Error;

    fn try_from(message: DescribeCollectionResponse) -> Result<Self> {
        let schema = message.schema.ok_or_else(|| Error::Authority {
            code: tonic::Code::Internal,
            message: format!("collection {} described without a schema", message.id),
        })?;
        Ok(Self {
            id: message.id,
            schema: schema.try_into()?,
            partitions: message.partitions,
            created_at: Timestamp::from_raw(message.created_at),
        })
    }
}

impl From<AssignSegmentResponse> for SegmentLease {
    fn from(message: AssignSegmentResponse) -> Self {
        Self {
            segment_id: message.segment_id,
            key: SegmentKey {
                collection_id: message.collection_id,
                partition_id: message.partition_id,
                channel: message.channel,
            },
            row_offset: message.row_offset,
            capacity_remaining: message.capacity,
            expires_at: Timestamp::from_raw(message.expires_at),
        }
    }
}
