//! Sidecar bridge client and its line protocol.

pub mod client;
pub mod protocol;

use std::{sync::Arc, time::Duration};

use chat_relay_core::{AutomationClient, ClientFactory, EventSink, UserId};

pub use client::BridgeClient;
pub use protocol::{BridgeCommand, BridgeMessage, BridgeRequest, ProtocolError, ProtocolPeer};

/// Default time to wait for a bridge response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How bridge processes are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Shell-quoted command line; `--client-id <user>` is appended.
    pub command: String,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    #[must_use]
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Creates one [`BridgeClient`] per session.
#[derive(Debug, Clone)]
pub struct BridgeFactory {
    config: BridgeConfig,
}

impl BridgeFactory {
    #[must_use]
    pub const fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for BridgeFactory {
    fn create(&self, user_id: &UserId, sink: EventSink) -> Arc<dyn AutomationClient> {
        Arc::new(BridgeClient::new(user_id.clone(), sink, self.config.clone()))
    }
}
