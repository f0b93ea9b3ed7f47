use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use crate::{terminated, Bus, BusError, BusMessage, BusResult, BusSubscription};

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

/// Redis PUBLISH/SUBSCRIBE transport.
///
/// Publishes share one multiplexed connection manager; each subscription
/// opens its own pub/sub connection, and losing that connection ends the
/// subscription.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        debug!(topic, "redis subscription established");

        let messages = pubsub.into_on_message().map(|msg| {
            Ok(BusMessage {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })
        });
        Ok(terminated(messages))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(topic, payload.as_ref()).await?;
        Ok(())
    }
}
