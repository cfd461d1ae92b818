//! Message shapes: what the platform reports, what live viewers see, and
//! what gets persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UserId;

/// A message as reported by the automation client.
///
/// `timestamp` is in Unix seconds, the platform's native resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
}

/// Payload of a live `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: i64,
    /// Human readable send time.
    pub time: String,
    /// Relative age such as `5m ago`.
    pub time_ago: String,
    pub from_me: bool,
}

impl FormattedMessage {
    /// Format a platform message relative to `now`.
    #[must_use]
    pub fn from_platform(msg: &PlatformMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: msg.id.clone(),
            from: msg.from.clone(),
            to: msg.to.clone(),
            text: msg.body.clone(),
            timestamp: msg.timestamp,
            time: format_timestamp(msg.timestamp),
            time_ago: format_time_ago(msg.timestamp, now),
            from_me: msg.from_me,
        }
    }
}

/// Fields supplied when persisting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub receiver: String,
    pub message: String,
    pub user_id: UserId,
}

impl NewMessage {
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        message: impl Into<String>,
        user_id: UserId,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            message: message.into(),
            user_id,
        }
    }
}

/// Persisted message record. Append-only: never updated or deleted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub message: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Build a fresh record stamped at `at`.
    #[must_use]
    pub fn new(msg: NewMessage, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: msg.sender,
            receiver: msg.receiver,
            message: msg.message,
            user_id: msg.user_id,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Render a Unix-seconds timestamp as e.g. `Feb 28, 2025, 3:45 PM` (UTC).
///
/// Out-of-range timestamps render as an empty string.
#[must_use]
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0).map_or_else(String::new, |dt| {
        dt.format("%b %-d, %Y, %-I:%M %p").to_string()
    })
}

/// Render the age of a Unix-seconds timestamp relative to `now`.
///
/// Minutes below one hour, hours below one day, days beyond. Timestamps in
/// the future count as `0m ago`.
#[must_use]
pub fn format_time_ago(timestamp: i64, now: DateTime<Utc>) -> String {
    let diff_ms = now
        .timestamp_millis()
        .saturating_sub(timestamp.saturating_mul(1000))
        .max(0);

    let minutes = diff_ms / (1000 * 60);
    if minutes < 60 {
        return format!("{minutes}m ago");
    }

    let hours = diff_ms / (1000 * 60 * 60);
    if hours < 24 {
        return format!("{hours}h ago");
    }

    format!("{}d ago", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    #[test]
    fn test_time_ago_buckets() {
        let now = at(1_740_757_500);
        assert_eq!(format_time_ago(1_740_757_500, now), "0m ago");
        assert_eq!(format_time_ago(1_740_757_500 - 59 * 60, now), "59m ago");
        assert_eq!(format_time_ago(1_740_757_500 - 60 * 60, now), "1h ago");
        assert_eq!(format_time_ago(1_740_757_500 - 23 * 3600 - 3599, now), "23h ago");
        assert_eq!(format_time_ago(1_740_757_500 - 24 * 3600, now), "1d ago");
        assert_eq!(format_time_ago(1_740_757_500 - 10 * 24 * 3600, now), "10d ago");
    }

    #[test]
    fn test_time_ago_future_is_zero() {
        let now = at(1_000);
        assert_eq!(format_time_ago(5_000, now), "0m ago");
    }

    #[test]
    fn test_format_timestamp() {
        // 2025-02-28T15:45:00Z
        assert_eq!(format_timestamp(1_740_757_500), "Feb 28, 2025, 3:45 PM");
        assert_eq!(format_timestamp(i64::MAX), "");
    }

    #[test]
    fn test_formatted_message_wire_names() {
        let msg = PlatformMessage {
            id: "ABC".to_string(),
            from: "111@c.us".to_string(),
            to: "222@c.us".to_string(),
            body: "hello".to_string(),
            timestamp: 1_740_757_500,
            from_me: false,
        };
        let formatted = FormattedMessage::from_platform(&msg, at(1_740_757_500 + 120));
        let json = serde_json::to_value(&formatted).unwrap();

        assert_eq!(json["text"], "hello");
        assert_eq!(json["timeAgo"], "2m ago");
        assert_eq!(json["fromMe"], false);
        assert_eq!(json["time"], "Feb 28, 2025, 3:45 PM");
        assert_eq!(json["timestamp"], 1_740_757_500);
    }

    #[test]
    fn test_record_layout() {
        let record = MessageRecord::new(
            NewMessage::new("me@c.us", "to123", "hi", UserId::new("u1")),
            at(1_740_757_500),
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["sender"], "me@c.us");
        assert_eq!(json["receiver"], "to123");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["userId"], "u1");
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["createdAt"], json["updatedAt"]);
    }
}
