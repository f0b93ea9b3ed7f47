//! One connected client: an inbound loop reading frames into the hub and an
//! outbound loop draining the session's queue onto the socket.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use chat_core::{ChatMessage, InboundFrame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport_bus::BusResult;
use uuid::Uuid;

use crate::hub::{outbound_queue, DeliveryReport, HubError, OutboundQueue, SessionHandle, SessionId};
use crate::store::StoreError;

/// Everything a session needs from its process.
#[async_trait]
pub trait SessionHost: Send + Sync {
    fn address(&self) -> &str;
    async fn register(&self, session: SessionHandle) -> Result<bool, HubError>;
    async fn unregister(&self, id: SessionId) -> Result<bool, HubError>;
    async fn deliver_local(&self, payload: Bytes) -> Result<DeliveryReport, HubError>;
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;
    async fn publish(&self, payload: Bytes) -> BusResult<()>;
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub outbound_buffer: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
        }
    }
}

pub struct ClientSession {
    id: SessionId,
    username: String,
    host: Arc<dyn SessionHost>,
    config: SessionConfig,
}

impl ClientSession {
    pub fn new(username: impl Into<String>, host: Arc<dyn SessionHost>, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            host,
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drives the session to completion. Returns once the client is gone and
    /// the session has been removed from the hub.
    pub async fn run<S, R, E>(self, sink: S, mut stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let (handle, queue) = outbound_queue(self.id, self.username.clone(), self.config.outbound_buffer);
        match self.host.register(handle).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(session_id = %self.id, "session id already registered; dropping connection");
                return;
            }
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "hub unavailable; dropping connection");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let mut writer = tokio::spawn(write_loop(
            sink,
            queue,
            cancel.clone(),
            self.id,
            self.config.ping_interval,
            self.config.write_wait,
        ));

        self.read_loop(&mut stream, &cancel).await;

        if let Err(err) = self.host.unregister(self.id).await {
            debug!(session_id = %self.id, error = %err, "unregister after hub shutdown");
        }
        if timeout(self.config.write_wait, &mut writer).await.is_err() {
            debug!(session_id = %self.id, "outbound loop did not finish in time; aborting");
            writer.abort();
        }
        info!(session_id = %self.id, username = %self.username, "session closed");
    }

    async fn read_loop<R, E>(&self, stream: &mut R, cancel: &CancellationToken)
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = %self.id, "outbound loop ended; stopping reads");
                    return;
                }
                next = timeout(self.config.pong_wait, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    info!(session_id = %self.id, "read deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(err))) => {
                    debug!(session_id = %self.id, error = %err, "websocket read failed");
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let parsed = match frame {
                Message::Text(text) => InboundFrame::parse(&text),
                Message::Binary(bytes) => InboundFrame::parse_bytes(&bytes),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return,
            };

            match parsed {
                Ok(inbound) => self.handle_inbound(inbound).await,
                Err(err) => {
                    counter!("chat_relay_frames_discarded_total", 1);
                    debug!(session_id = %self.id, error = %err, "discarding malformed frame");
                }
            }
        }
    }

    async fn handle_inbound(&self, inbound: InboundFrame) {
        counter!("chat_relay_messages_received_total", 1);
        let message = ChatMessage::new(self.username.clone(), inbound.content, self.host.address());
        let message = match self.host.save(message.clone()).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to persist message");
                message
            }
        };

        let payload = match message.to_payload() {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode message");
                return;
            }
        };

        let (local, published) = tokio::join!(
            self.host.deliver_local(payload.clone()),
            self.host.publish(payload)
        );
        if let Err(err) = local {
            warn!(session_id = %self.id, error = %err, "local delivery failed");
        }
        if let Err(err) = published {
            counter!("chat_relay_publish_failures_total", 1);
            warn!(session_id = %self.id, error = %err, "failed to publish message to bus");
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut queue: OutboundQueue,
    cancel: CancellationToken,
    session_id: SessionId,
    ping_interval: Duration,
    write_wait: Duration,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let _stop_reader = cancel.drop_guard();
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(payload) => {
                    if let Err(reason) = send_with_deadline(&mut sink, payload_message(payload), write_wait).await {
                        debug!(%session_id, error = %reason, "websocket write failed");
                        break;
                    }
                }
                None => {
                    if let Err(reason) = send_with_deadline(&mut sink, Message::Close(None), write_wait).await {
                        debug!(%session_id, error = %reason, "failed to send close frame");
                    }
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(reason) = send_with_deadline(&mut sink, Message::Ping(Vec::new()), write_wait).await {
                    debug!(%session_id, error = %reason, "ping failed");
                    break;
                }
            }
        }
    }

    match timeout(write_wait, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%session_id, error = %err, "websocket close failed"),
        Err(_) => debug!(%session_id, "websocket close exceeded write deadline"),
    }
}

async fn send_with_deadline<S>(sink: &mut S, message: Message, deadline: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

fn payload_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}
