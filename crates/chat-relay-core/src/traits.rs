//! Core traits for message storage and the automation client.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    UserId,
    message::{MessageRecord, NewMessage, PlatformMessage},
};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Entry exists but the client has not been started.
    Uninitialized,
    /// Client started, waiting for the user to answer a login challenge.
    AwaitingChallenge,
    /// Client authenticated.
    Ready,
    /// Soft teardown completed (or the client disconnected on its own).
    LoggedOut,
    /// Hard teardown completed.
    Destroyed,
}

/// How a session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Sign out; the user can initialize again later.
    Soft,
    /// Release every client resource.
    Hard,
}

impl TeardownMode {
    /// State a session ends in after this teardown.
    #[must_use]
    pub const fn final_state(self) -> SessionState {
        match self {
            Self::Soft => SessionState::LoggedOut,
            Self::Hard => SessionState::Destroyed,
        }
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Persistence boundary for message records.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message record.
    async fn store(&self, msg: NewMessage) -> Result<MessageRecord, StoreError>;

    /// All records stored for a user, oldest first.
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<MessageRecord>, StoreError>;
}

/// Chat summary reported by the automation client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<PlatformMessage>,
}

/// Contact reported by the automation client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    pub number: String,
}

impl Contact {
    /// Push name, falling back to the saved name.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.push_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.name.as_deref())
    }
}

/// Automation client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client is not connected")]
    NotConnected,
    #[error("Client request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Client rejected request: {0}")]
    Rejected(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event reported by an automation client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A new login challenge was issued. Supersedes any earlier one.
    Challenge(String),
    /// The client authenticated as `identity`.
    Ready { identity: String },
    /// A message arrived.
    Message(PlatformMessage),
    /// The client lost its session and will not recover on its own.
    Disconnected { reason: String },
}

/// A client event tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEnvelope {
    pub user_id: UserId,
    /// Generation of the session the emitting client belongs to.
    pub generation: u64,
    pub event: ClientEvent,
}

type Deliver = Arc<dyn Fn(SinkEnvelope) + Send + Sync>;

/// Where a client pushes its events.
///
/// Each client gets a sink bound to its user and session generation, so
/// events from a replaced client can be told apart from the current one.
#[derive(Clone)]
pub struct EventSink {
    user_id: UserId,
    generation: u64,
    deliver: Deliver,
}

impl EventSink {
    /// Create a sink that hands every envelope to `deliver`.
    pub fn new(
        user_id: UserId,
        generation: u64,
        deliver: impl Fn(SinkEnvelope) + Send + Sync + 'static,
    ) -> Self {
        Self {
            user_id,
            generation,
            deliver: Arc::new(deliver),
        }
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Push an event.
    pub fn emit(&self, event: ClientEvent) {
        (self.deliver)(SinkEnvelope {
            user_id: self.user_id.clone(),
            generation: self.generation,
            event,
        });
    }

    /// Push a challenge notification.
    pub fn push_challenge<S: Into<String>>(&self, value: S) {
        self.emit(ClientEvent::Challenge(value.into()));
    }

    /// Push ready notification.
    pub fn push_ready<S: Into<String>>(&self, identity: S) {
        self.emit(ClientEvent::Ready {
            identity: identity.into(),
        });
    }

    /// Push an inbound message.
    pub fn push_message(&self, msg: PlatformMessage) {
        self.emit(ClientEvent::Message(msg));
    }

    /// Push disconnected notification.
    pub fn push_disconnected<S: Into<String>>(&self, reason: S) {
        self.emit(ClientEvent::Disconnected {
            reason: reason.into(),
        });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("user_id", &self.user_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Handle to one user's third-party automation client.
///
/// Lifecycle notifications are not returned from these calls; they arrive
/// through the [`EventSink`] the client was created with.
#[async_trait]
pub trait AutomationClient: Send + Sync {
    /// Begin connecting. Challenges and readiness are reported as events.
    async fn start(&self) -> Result<(), ClientError>;

    /// Authenticated identity, `None` until the client is ready.
    fn identity(&self) -> Option<String>;

    /// Send a text message.
    async fn send_message(&self, to: &str, text: &str) -> Result<(), ClientError>;

    /// List chats.
    async fn chats(&self) -> Result<Vec<Chat>, ClientError>;

    /// Most recent messages of a chat, oldest first.
    async fn chat_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, ClientError>;

    /// Look up one contact.
    async fn contact(&self, contact_id: &str) -> Result<Contact, ClientError>;

    /// List contacts.
    async fn contacts(&self) -> Result<Vec<Contact>, ClientError>;

    /// Profile picture URL, if the contact has a visible one.
    async fn profile_pic_url(&self, contact_id: &str) -> Result<Option<String>, ClientError>;

    /// Sign out (`Soft`) or release every resource (`Hard`).
    async fn shutdown(&self, mode: TeardownMode) -> Result<(), ClientError>;
}

/// Creates automation clients.
pub trait ClientFactory: Send + Sync {
    /// Build a client for `user_id`. Must not block or perform I/O: it runs
    /// while the registry holds the user's entry locked.
    fn create(&self, user_id: &UserId, sink: EventSink) -> Arc<dyn AutomationClient>;
}
