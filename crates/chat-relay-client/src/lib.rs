//! Automation client adapters.
//!
//! Provides:
//! - `BridgeClient` - Drives a sidecar process over newline-delimited JSON
//! - `LoopbackClient` - In-process simulated platform for demos and tests
//! - Command building utilities

pub mod bridge;
pub mod command;
pub mod loopback;

pub use bridge::{BridgeClient, BridgeConfig, BridgeFactory};
pub use command::{CommandBuilder, CommandParts};
pub use loopback::{LoopbackClient, LoopbackFactory};
