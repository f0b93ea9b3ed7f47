use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chat_core::ChatMessage;
use tokio::task::JoinHandle;
use transport_bus::{Bus, BusResult};

use crate::bridge::{BridgeError, BusBridge};
use crate::hub::{DeliveryReport, Hub, HubConfig, HubError, SessionHandle, SessionId};
use crate::reporter::LoadReporter;
use crate::session::SessionHost;
use crate::store::{MessageStore, StoreError};

/// A chat process: its hub, its bus bridge and its message store.
#[derive(Clone)]
pub struct ChatNode {
    hub: Hub,
    bridge: BusBridge,
    store: Arc<dyn MessageStore>,
}

/// Background tasks owned by a running node.
pub struct NodeTasks {
    pub dispatch: JoinHandle<()>,
    pub bridge: JoinHandle<BridgeError>,
}

impl ChatNode {
    pub async fn start(
        address: impl Into<String>,
        bus: Arc<dyn Bus>,
        channel: impl Into<String>,
        store: Arc<dyn MessageStore>,
        reporter: Arc<dyn LoadReporter>,
        hub_config: HubConfig,
    ) -> Result<(Self, NodeTasks), BridgeError> {
        let address = address.into();
        let (hub, dispatch) = Hub::spawn(address.clone(), reporter, hub_config);
        let bridge = BusBridge::new(bus, channel, address);
        let bridge_task = match bridge.start(hub.clone()).await {
            Ok(task) => task,
            Err(err) => {
                dispatch.abort();
                return Err(err);
            }
        };
        Ok((
            Self { hub, bridge, store },
            NodeTasks {
                dispatch,
                bridge: bridge_task,
            },
        ))
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn bridge(&self) -> &BusBridge {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}

#[async_trait]
impl SessionHost for ChatNode {
    fn address(&self) -> &str {
        self.hub.address()
    }

    async fn register(&self, session: SessionHandle) -> Result<bool, HubError> {
        self.hub.register(session).await
    }

    async fn unregister(&self, id: SessionId) -> Result<bool, HubError> {
        self.hub.unregister(id).await
    }

    async fn deliver_local(&self, payload: Bytes) -> Result<DeliveryReport, HubError> {
        self.hub.deliver_local(payload).await
    }

    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        self.store.save(message).await
    }

    async fn publish(&self, payload: Bytes) -> BusResult<()> {
        self.bridge.publish(payload).await
    }
}
