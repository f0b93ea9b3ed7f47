use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A chat line as it travels between sessions, relays and the store.
///
/// `id` is only present once the message has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub username: String,
    pub content: String,
    pub server: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        username: impl Into<String>,
        content: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            username: username.into(),
            content: content.into(),
            server: server.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// True when the message was produced by a session on `address`.
    pub fn originated_at(&self, address: &str) -> bool {
        self.server == address
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(FrameError::Encode)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(payload).map_err(FrameError::InvalidJson)
    }
}

/// Frame sent by a connected client. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    pub content: String,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::InvalidJson)
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(bytes).map_err(FrameError::InvalidJson)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame payload: {0}")]
    InvalidJson(serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn outbound_frame_shape() {
        let msg = ChatMessage::new("alice", "hi", "ws://127.0.0.1:8080");
        let value: serde_json::Value = serde_json::from_slice(&msg.to_payload().unwrap()).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["server"], "ws://127.0.0.1:8080");
        assert!(value["timestamp"].is_string());
        assert!(value.get("id").is_none());

        let stored = msg.with_id(7);
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["id"], 7);
    }

    #[test_timeout::timeout]
    fn inbound_frame_ignores_extra_fields() {
        let frame = InboundFrame::parse(r#"{"content":"hello","username":"mallory"}"#).unwrap();
        assert_eq!(frame.content, "hello");
    }

    #[test_timeout::timeout]
    fn inbound_frame_requires_content() {
        assert!(InboundFrame::parse(r#"{"text":"hello"}"#).is_err());
        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test_timeout::timeout]
    fn origin_check_uses_server_address() {
        let msg = ChatMessage::new("bob", "yo", "ws://a:1");
        assert!(msg.originated_at("ws://a:1"));
        assert!(!msg.originated_at("ws://b:2"));
    }
}
