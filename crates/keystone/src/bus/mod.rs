//! Message-bus producers.
//!
//! The bus is an external publish/subscribe system. This core only produces:
//! manipulation records go to `manipulation-{i}` channels, search requests to
//! `query` and progress marks to `timetick`. Every message carries the
//! timestamp that orders it.

mod grpc;
mod memory;

pub use grpc::{GrpcBus, GrpcProducer};
pub use memory::InMemoryBus;

use crate::{
    config::BusConfig,
    error::{Error, Result},
    types::{Timestamp, UniqueId},
};
use bytes::Bytes;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// Position of a message within its channel, assigned by the bus.
pub type MessageId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl BusMessage {
    /// Decodes a JSON payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::Bus {
            channel: self.channel.clone(),
            reason: format!("undecodable payload: {e}"),
        })
    }
}

/// Encodes a record as a JSON payload.
pub fn encode<T: Serialize>(record: &T) -> Result<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| Error::invalid(format!("unencodable record: {e}")))
}

/// Publishes to one channel.
#[tonic::async_trait]
pub trait Producer: Send + Sync {
    fn channel(&self) -> &str;

    async fn publish(&self, timestamp: Timestamp, payload: Bytes) -> Result<MessageId>;

    /// Flushes and releases the producer. Later publishes fail with
    /// [`Error::ServiceShutdown`].
    async fn close(&self) -> Result<()>;
}

#[tonic::async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn create_producer(&self, channel: &str) -> Result<Arc<dyn Producer>>;
}

/// Every producer the core publishes through, created once at startup.
pub struct Producers {
    config: BusConfig,
    manipulation: BTreeMap<String, Arc<dyn Producer>>,
    query: Arc<dyn Producer>,
    timetick: Arc<dyn Producer>,
}

impl Producers {
    pub async fn create(bus: &dyn MessageBus, config: &BusConfig) -> Result<Self> {
        let mut manipulation = BTreeMap::new();
        for name in config.manipulation_channel_names() {
            let producer = bus.create_producer(&name).await?;
            manipulation.insert(name, producer);
        }
        let query = bus.create_producer(BusConfig::QUERY_CHANNEL).await?;
        let timetick = bus.create_producer(BusConfig::TIMETICK_CHANNEL).await?;
        tracing::info!(
            manipulation = manipulation.len(),
            "Created message bus producers"
        );
        Ok(Self {
            config: config.clone(),
            manipulation,
            query,
            timetick,
        })
    }

    /// The producer for a collection's manipulation channel.
    pub fn manipulation(&self, collection_id: UniqueId) -> Result<&Arc<dyn Producer>> {
        let channel = self.config.manipulation_channel(collection_id);
        self.manipulation.get(&channel).ok_or(Error::Bus {
            channel,
            reason: "no producer for channel".to_string(),
        })
    }

    pub fn query(&self) -> &Arc<dyn Producer> {
        &self.query
    }

    pub fn timetick(&self) -> &Arc<dyn Producer> {
        &self.timetick
    }

    /// Closes every producer, logging failures instead of stopping at the
    /// first one.
    pub async fn close_all(&self) {
        let all = self
            .manipulation
            .values()
            .chain([&self.query, &self.timetick]);
        for producer in all {
            if let Err(e) = producer.close().await {
                tracing::warn!(channel = producer.channel(), "Failed to close producer: {e}");
            }
        }
        tracing::info!("Message bus producers closed");
    }
}
