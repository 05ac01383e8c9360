use super::{BusMessage, MessageBus, MessageId, Producer};
use crate::{
    error::{Error, Result},
    types::Timestamp,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use tokio::sync::broadcast;

const SUBSCRIBER_CAPACITY: usize = 1024;
const RETAINED_PER_CHANNEL: usize = 10_000;

struct Topic {
    sender: broadcast::Sender<BusMessage>,
    retained: VecDeque<BusMessage>,
    next_id: MessageId,
}

impl Topic {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            sender,
            retained: VecDeque::new(),
            next_id: 0,
        }
    }
}

#[derive(Default)]
struct Shared {
    topics: Mutex<HashMap<String, Topic>>,
    failures: AtomicU32,
}

/// An in-process bus. Live subscribers receive messages through a broadcast
/// channel; the most recent messages of each channel are also retained for
/// inspection.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives messages published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.shared
            .topics
            .lock()
            .entry(channel.to_string())
            .or_insert_with(Topic::new)
            .sender
            .subscribe()
    }

    /// Retained messages of `channel`, oldest first.
    pub fn messages(&self, channel: &str) -> Vec<BusMessage> {
        self.shared
            .topics
            .lock()
            .get(channel)
            .map(|t| t.retained.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next(&self, n: u32) {
        self.shared.failures.store(n, Ordering::SeqCst);
    }
}

#[tonic::async_trait]
impl MessageBus for InMemoryBus {
    async fn create_producer(&self, channel: &str) -> Result<Arc<dyn Producer>> {
        self.shared
            .topics
            .lock()
            .entry(channel.to_string())
            .or_insert_with(Topic::new);
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
            channel: channel.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    channel: String,
    closed: AtomicBool,
}

#[tonic::async_trait]
impl Producer for MemoryProducer {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(&self, timestamp: Timestamp, payload: Bytes) -> Result<MessageId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        let injected = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Bus {
                channel: self.channel.clone(),
                reason: "injected failure".to_string(),
            });
        }

        let message = BusMessage {
            channel: self.channel.clone(),
            timestamp,
            payload,
        };
        let mut topics = self.shared.topics.lock();
        let topic = topics
            .entry(self.channel.clone())
            .or_insert_with(Topic::new);
        let id = topic.next_id;
        topic.next_id += 1;
        if topic.retained.len() == RETAINED_PER_CHANNEL {
            topic.retained.pop_front();
        }
        topic.retained.push_back(message.clone());
        // No live subscriber is not an error.
        let _ = topic.sender.send(message);
        Ok(id)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_messages_in_order() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("query");
        let producer = bus.create_producer("query").await.unwrap();

        let first = producer
            .publish(Timestamp::from_raw(10), Bytes::from_static(b"a"))
            .await
            .unwrap();
        let second = producer
            .publish(Timestamp::from_raw(20), Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert!(second > first);

        assert_eq!(rx.recv().await.unwrap().timestamp, Timestamp::from_raw(10));
        assert_eq!(rx.recv().await.unwrap().timestamp, Timestamp::from_raw(20));
        assert_eq!(bus.messages("query").len(), 2);
    }

    #[tokio::test]
    async fn closed_producers_refuse_publishes() {
        let bus = InMemoryBus::new();
        let producer = bus.create_producer("timetick").await.unwrap();
        producer.close().await.unwrap();
        let result = producer
            .publish(Timestamp::from_raw(1), Bytes::new())
            .await;
        assert!(matches!(result, Err(Error::ServiceShutdown)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let bus = InMemoryBus::new();
        bus.fail_next(1);
        let producer = bus.create_producer("query").await.unwrap();
        let err = producer
            .publish(Timestamp::from_raw(1), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(producer.publish(Timestamp::from_raw(2), Bytes::new()).await.is_ok());
    }
}
