use super::{
    Authority, AuthorityConnector, CollectionInfo, SchemaAck, SchemaChange, SegmentLease,
    SegmentRequest,
};
use crate::{
    allocator::AllocationRange,
    error::{Error, Result},
    proto::{self, paths, unary},
};
use core::time::Duration;
use std::sync::Arc;
use tonic::{
    Code,
    transport::{Channel, Endpoint},
};

/// Dials a remote authority once at startup.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    pub addr: String,
    pub dial_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(3),
        }
    }
}

#[tonic::async_trait]
impl AuthorityConnector for GrpcConnector {
    async fn connect(&self) -> Result<Arc<dyn Authority>> {
        tracing::info!(addr = %self.addr, "Connecting to authority");
        let endpoint = Endpoint::from_shared(self.addr.clone())?
            .connect_timeout(self.dial_timeout)
            .tcp_nodelay(true);

        let channel = match tokio::time::timeout(self.dial_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                tracing::error!(addr = %self.addr, "Authority connection failed: {e}");
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!(addr = %self.addr, "Authority dial timed out");
                return Err(Error::Authority {
                    code: Code::DeadlineExceeded,
                    message: format!("dial to {} timed out after {:?}", self.addr, self.dial_timeout),
                });
            }
        };

        tracing::info!(addr = %self.addr, "Connected to authority");
        Ok(Arc::new(GrpcAuthority::new(channel, self.rpc_timeout)))
    }
}

/// [`Authority`] reached over a shared tonic [`Channel`].
///
/// `Channel` multiplexes concurrent calls, so clones are cheap and no lock is
/// held across a call.
#[derive(Clone, Debug)]
pub struct GrpcAuthority {
    channel: Channel,
    rpc_timeout: Duration,
}

impl GrpcAuthority {
    pub fn new(channel: Channel, rpc_timeout: Duration) -> Self {
        Self {
            channel,
            rpc_timeout,
        }
    }

    async fn allocate(&self, path: &'static str, count: u32) -> Result<AllocationRange> {
        let response: proto::AllocateResponse = unary(
            &self.channel,
            path,
            proto::AllocateRequest { count },
            self.rpc_timeout,
        )
        .await?;
        if response.end < response.start {
            return Err(Error::Authority {
                code: Code::Internal,
                message: format!(
                    "authority returned an inverted range [{}, {})",
                    response.start, response.end
                ),
            });
        }
        Ok(AllocationRange::new(response.start, response.end, count))
    }
}

#[tonic::async_trait]
impl Authority for GrpcAuthority {
    async fn allocate_ids(&self, count: u32) -> Result<AllocationRange> {
        self.allocate(paths::ALLOCATE_IDS, count).await
    }

    async fn allocate_timestamps(&self, count: u32) -> Result<AllocationRange> {
        self.allocate(paths::ALLOCATE_TIMESTAMPS, count).await
    }

    async fn assign_segment(&self, request: SegmentRequest) -> Result<SegmentLease> {
        let message = proto::AssignSegmentRequest {
            collection_id: request.key.collection_id,
            partition_id: request.key.partition_id,
            channel: request.key.channel,
            row_count: request.row_count,
        };
        let response: proto::AssignSegmentResponse = unary(
            &self.channel,
            paths::ASSIGN_SEGMENT,
            message,
            self.rpc_timeout,
        )
        .await
        .map_err(|status| match status.code() {
            Code::FailedPrecondition => Error::AdmissionDenied {
                reason: status.message().to_string(),
            },
            _ => status.into(),
        })?;
        Ok(response.into())
    }

    async fn apply_schema_change(&self, change: SchemaChange) -> Result<SchemaAck> {
        let response: proto::SchemaChangeResponse = unary(
            &self.channel,
            paths::APPLY_SCHEMA_CHANGE,
            proto::SchemaChangeRequest::from(&change),
            self.rpc_timeout,
        )
        .await?;
        Ok(response.into())
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        let response: proto::DescribeCollectionResponse = unary(
            &self.channel,
            paths::DESCRIBE_COLLECTION,
            proto::DescribeCollectionRequest {
                name: name.to_string(),
            },
            self.rpc_timeout,
        )
        .await?;
        response.try_into()
    }

    async fn show_collections(&self) -> Result<Vec<String>> {
        let response: proto::ShowCollectionsResponse = unary(
            &self.channel,
            paths::SHOW_COLLECTIONS,
            proto::ShowCollectionsRequest {},
            self.rpc_timeout,
        )
        .await?;
        Ok(response.names)
    }
}
