//! Wire types shared by the chat relay processes and the routing registry.

pub mod message;
pub mod routing;

pub use message::{ChatMessage, FrameError, InboundFrame};
pub use routing::LoadReport;
