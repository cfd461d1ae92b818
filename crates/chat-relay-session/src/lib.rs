//! Session orchestration and message storage for chat relay.
//!
//! Provides:
//! - `SessionRegistry` - One automation client per user, driven by its events
//! - Read-side views over chats, chat history and contacts
//! - Storage implementations (memory, SQLite)

pub mod registry;
pub mod storage;
pub mod views;

pub use registry::{
    ChallengeStatus, InitializeOutcome, RegistryError, SessionRegistry, TeardownOutcome,
};
pub use views::{ChatList, ChatMessageView, ChatSummary, ContactView};
