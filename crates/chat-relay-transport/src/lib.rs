//! HTTP surface for chat relay.
//!
//! Provides:
//! - JSON API over the session registry
//! - Server-sent events live stream
//! - WebSocket live stream (feature: websocket)

pub mod error;
pub mod protocol;
pub mod routes;
pub mod sse;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use error::ApiError;
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{AppState, router};
