//! Chat relay process.
//!
//! Each relay holds a subset of client WebSocket connections in its [`hub`],
//! relays every inbound message to its own clients and, through the
//! [`bridge`], to every other relay subscribed to the same bus channel. The
//! relay keeps the router informed of its session count via [`reporter`].

pub mod bridge;
pub mod config;
pub mod hub;
pub mod node;
pub mod reporter;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;
