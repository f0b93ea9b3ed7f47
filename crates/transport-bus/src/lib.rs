use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

#[cfg(feature = "redis")]
mod redis_bus;

#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged; {0} messages skipped")]
    Lagged(u64),
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Whether the subscription that produced this error can keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BusError::Lagged(_))
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Live subscription to one topic.
///
/// The stream never restarts. It yields messages until the underlying
/// transport fails, then yields a final error and ends.
pub type BusSubscription = BoxStream<'static, BusResult<BusMessage>>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus backed by tokio broadcast channels.
///
/// Every relay sharing one `LocalBus` behaves like a set of processes
/// attached to the same broker, which is how tests wire several hubs together.
#[derive(Debug)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
    severed: AtomicBool,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            severed: AtomicBool::new(false),
        }
    }

    /// Simulates losing the broker: live subscriptions terminate with
    /// [`BusError::Closed`] and later publish/subscribe calls fail.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.severed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        self.ensure_open()?;
        let receiver = self.sender_for(topic).subscribe();
        let messages = BroadcastStream::new(receiver).map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(skipped)| BusError::Lagged(skipped))
        });
        Ok(terminated(messages))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_open()?;
        let sender = self.sender_for(topic);
        // A topic with no subscribers simply drops the message.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Appends the terminal `Closed` error that marks the end of a subscription.
pub(crate) fn terminated<S>(messages: S) -> BusSubscription
where
    S: futures::Stream<Item = BusResult<BusMessage>> + Send + 'static,
{
    messages
        .chain(stream::once(async { Err(BusError::Closed) }))
        .boxed()
}
