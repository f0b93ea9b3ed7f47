//! Glue between a hub and the cross-process bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chat_core::ChatMessage;
use futures_util::StreamExt;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use transport_bus::{Bus, BusError, BusResult, BusSubscription};

use crate::hub::Hub;

pub const DEFAULT_CHANNEL: &str = "chat-messages";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to subscribe to `{channel}`: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: BusError,
    },
    #[error("subscription to `{channel}` lost: {reason}")]
    SubscriptionLost { channel: String, reason: String },
    #[error("hub stopped while the bridge was running")]
    HubStopped,
}

#[derive(Clone)]
pub struct BusBridge {
    bus: Arc<dyn Bus>,
    channel: Arc<str>,
    address: Arc<str>,
    up: Arc<AtomicBool>,
}

impl BusBridge {
    pub fn new(bus: Arc<dyn Bus>, channel: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            bus,
            channel: Arc::from(channel.into()),
            address: Arc::from(address.into()),
            up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the subscription loop is currently running.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, payload: Bytes) -> BusResult<()> {
        self.bus.publish(&self.channel, payload).await
    }

    /// Subscribes, then feeds every foreign message into `hub` until the
    /// subscription ends. The task's output says why it stopped.
    pub async fn start(&self, hub: Hub) -> Result<JoinHandle<BridgeError>, BridgeError> {
        let subscription =
            self.bus
                .subscribe(&self.channel)
                .await
                .map_err(|source| BridgeError::Subscribe {
                    channel: self.channel.to_string(),
                    source,
                })?;
        self.up.store(true, Ordering::SeqCst);
        gauge!("chat_relay_bridge_up", 1.0);
        debug!(channel = %self.channel, address = %self.address, "bus subscription established");

        let bridge = self.clone();
        Ok(tokio::spawn(async move {
            let reason = bridge.read_loop(subscription, hub).await;
            bridge.up.store(false, Ordering::SeqCst);
            gauge!("chat_relay_bridge_up", 0.0);
            error!(
                channel = %bridge.channel,
                address = %bridge.address,
                error = %reason,
                "bus bridge stopped; cross-process delivery unavailable"
            );
            reason
        }))
    }

    async fn read_loop(&self, mut subscription: BusSubscription, hub: Hub) -> BridgeError {
        while let Some(next) = subscription.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) if err.is_recoverable() => {
                    warn!(channel = %self.channel, error = %err, "bus subscriber lagged");
                    counter!("chat_relay_bridge_lagged_total", 1);
                    continue;
                }
                Err(err) => return self.lost(err.to_string()),
            };

            match ChatMessage::from_payload(&message.payload) {
                Ok(chat) if chat.originated_at(&self.address) => continue,
                Ok(_) => {}
                Err(err) => {
                    debug!(channel = %self.channel, error = %err, "forwarding opaque bus payload");
                }
            }

            if hub.deliver_local(message.payload).await.is_err() {
                return BridgeError::HubStopped;
            }
        }
        self.lost("subscription stream ended".to_string())
    }

    fn lost(&self, reason: String) -> BridgeError {
        BridgeError::SubscriptionLost {
            channel: self.channel.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hub::{outbound_queue, HubConfig};
    use crate::reporter::NoopLoadReporter;
    use transport_bus::LocalBus;
    use uuid::Uuid;

    fn hub(address: &str) -> Hub {
        Hub::spawn(address, Arc::new(NoopLoadReporter), HubConfig::default()).0
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn foreign_messages_reach_local_sessions() {
        let bus = Arc::new(LocalBus::new());
        let hub = hub("ws://b:2");
        let bridge = BusBridge::new(bus.clone(), DEFAULT_CHANNEL, "ws://b:2");
        let _task = bridge.start(hub.clone()).await.unwrap();
        let (handle, mut queue) = outbound_queue(Uuid::new_v4(), "bob", 8);
        hub.register(handle).await.unwrap();

        let payload = Bytes::from(
            ChatMessage::new("alice", "hi", "ws://a:1")
                .to_payload()
                .unwrap(),
        );
        bus.publish(DEFAULT_CHANNEL, payload.clone()).await.unwrap();

        assert_eq!(queue.recv().await.unwrap(), payload);
        assert!(bridge.is_up());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn own_messages_are_not_echoed() {
        let bus = Arc::new(LocalBus::new());
        let hub = hub("ws://a:1");
        let bridge = BusBridge::new(bus.clone(), DEFAULT_CHANNEL, "ws://a:1");
        let _task = bridge.start(hub.clone()).await.unwrap();
        let (handle, mut queue) = outbound_queue(Uuid::new_v4(), "alice", 8);
        hub.register(handle).await.unwrap();

        let own = ChatMessage::new("alice", "mine", "ws://a:1");
        let foreign = ChatMessage::new("carol", "theirs", "ws://c:3");
        bridge
            .publish(Bytes::from(own.to_payload().unwrap()))
            .await
            .unwrap();
        bridge
            .publish(Bytes::from(foreign.to_payload().unwrap()))
            .await
            .unwrap();

        let received = ChatMessage::from_payload(&queue.recv().await.unwrap()).unwrap();
        assert_eq!(received.content, "theirs");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), queue.recv())
                .await
                .is_err()
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn severed_bus_surfaces_subscription_lost() {
        let bus = Arc::new(LocalBus::new());
        let hub = hub("ws://a:1");
        let bridge = BusBridge::new(bus.clone(), DEFAULT_CHANNEL, "ws://a:1");
        let task = bridge.start(hub).await.unwrap();

        bus.sever();

        let reason = task.await.unwrap();
        assert!(matches!(reason, BridgeError::SubscriptionLost { .. }));
        assert!(!bridge.is_up());
        assert!(bridge.publish(Bytes::from_static(b"{}")).await.is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn subscribe_failure_is_reported() {
        let bus = Arc::new(LocalBus::new());
        bus.sever();
        let bridge = BusBridge::new(bus, DEFAULT_CHANNEL, "ws://a:1");

        let err = bridge.start(hub("ws://a:1")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Subscribe { .. }));
        assert!(!bridge.is_up());
    }
}
