use super::{MessageBus, MessageId, Producer};
use crate::{
    error::{Error, Result},
    proto::{self, paths, unary},
    types::Timestamp,
};
use bytes::Bytes;
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tonic::transport::{Channel, Endpoint};

/// A remote bus reached over gRPC. Producers share one connection.
#[derive(Clone, Debug)]
pub struct GrpcBus {
    channel: Channel,
    rpc_timeout: Duration,
}

impl GrpcBus {
    pub async fn connect(addr: &str, dial_timeout: Duration, rpc_timeout: Duration) -> Result<Self> {
        tracing::info!(addr, "Connecting to message bus");
        let endpoint = Endpoint::from_shared(addr.to_string())?
            .connect_timeout(dial_timeout)
            .tcp_nodelay(true);
        let channel = endpoint.connect().await.map_err(|e| Error::Bus {
            channel: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            channel,
            rpc_timeout,
        })
    }
}

#[tonic::async_trait]
impl MessageBus for GrpcBus {
    async fn create_producer(&self, channel: &str) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(GrpcProducer {
            transport: self.channel.clone(),
            channel: channel.to_string(),
            rpc_timeout: self.rpc_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct GrpcProducer {
    transport: Channel,
    channel: String,
    rpc_timeout: Duration,
    closed: AtomicBool,
}

#[tonic::async_trait]
impl Producer for GrpcProducer {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(&self, timestamp: Timestamp, payload: Bytes) -> Result<MessageId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        let request = proto::PublishRequest {
            channel: self.channel.clone(),
            timestamp: timestamp.to_raw(),
            payload,
        };
        let response: proto::PublishResponse =
            unary(&self.transport, paths::PUBLISH, request, self.rpc_timeout)
                .await
                .map_err(|status| Error::Bus {
                    channel: self.channel.clone(),
                    reason: format!("{:?}: {}", status.code(), status.message()),
                })?;
        Ok(response.message_id)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
