//! Core abstractions for multi-tenant messaging sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `EventBus` - Topic-keyed publish/subscribe with idempotent unsubscribe
//! - `ChallengeCache` - Latest login challenge per user
//! - `StreamManager` - Per-connection live streams (connection, heartbeat, message)
//! - `LiveEvent` - Wire framing for live updates
//! - `MessageStore`, `AutomationClient` and `ClientFactory` traits

pub mod challenge;
pub mod event_bus;
pub mod live_event;
pub mod message;
pub mod stream;
pub mod traits;
pub mod user;

pub use challenge::ChallengeCache;
pub use event_bus::{EventBus, Subscription};
pub use live_event::LiveEvent;
pub use message::{FormattedMessage, MessageRecord, NewMessage, PlatformMessage};
pub use stream::{LiveStream, StreamConfig, StreamManager};
pub use traits::{
    AutomationClient, Chat, ClientError, ClientEvent, ClientFactory, Contact, EventSink,
    MessageStore, SessionState, SinkEnvelope, StoreError, TeardownMode,
};
pub use user::UserId;
