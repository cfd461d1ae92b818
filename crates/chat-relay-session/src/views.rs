//! Read-side views returned by the registry's query operations.

use chat_relay_core::{
    Chat, Contact, PlatformMessage,
    message::{format_time_ago, format_timestamp},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of messages returned for one chat.
pub const CHAT_HISTORY_LIMIT: usize = 10;

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "unReadChatCount")]
    pub unread_chat_count: u32,
    /// Body of the last message.
    pub last_message: Option<String>,
    /// Age of the last message, e.g. `2h ago`.
    pub time: Option<String>,
    /// Profile picture URL.
    pub avatar: Option<String>,
}

impl ChatSummary {
    #[must_use]
    pub fn new(chat: Chat, avatar: Option<String>, now: DateTime<Utc>) -> Self {
        let time = chat
            .last_message
            .as_ref()
            .map(|msg| format_time_ago(msg.timestamp, now));
        Self {
            id: chat.id,
            name: chat.name,
            unread_chat_count: chat.unread_count,
            last_message: chat.last_message.map(|msg| msg.body),
            time,
            avatar,
        }
    }
}

/// Chat list body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatList {
    pub users: Vec<ChatSummary>,
}

/// One message of a chat's recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageView {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub time: String,
}

impl From<PlatformMessage> for ChatMessageView {
    fn from(msg: PlatformMessage) -> Self {
        Self {
            time: format_timestamp(msg.timestamp),
            id: msg.id,
            from: msg.from,
            to: msg.to,
            text: msg.body,
        }
    }
}

/// Contact details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactView {
    pub id: String,
    pub name: Option<String>,
    pub number: String,
}

impl From<Contact> for ContactView {
    fn from(contact: Contact) -> Self {
        Self {
            name: contact.display_name().map(str::to_string),
            id: contact.id,
            number: contact.number,
        }
    }
}
