//! Typed live-update event framing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Greeting carried by the first event of every live stream.
pub const CONNECTION_GREETING: &str = "Connected to WhatsApp message stream";

/// One event on a viewer's live stream.
///
/// Serializes as `{"type": "connection" | "heartbeat" | "message", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveEvent {
    /// Sent once when the stream opens.
    Connection { message: String },
    /// Periodic keep-alive with an ISO-8601 timestamp.
    Heartbeat { timestamp: String },
    /// A formatted message published on the user's message topic.
    Message { data: Value },
}

impl LiveEvent {
    /// The connection greeting.
    #[must_use]
    pub fn connection() -> Self {
        Self::Connection {
            message: CONNECTION_GREETING.to_string(),
        }
    }

    /// Heartbeat stamped at `at`, millisecond precision with a `Z` suffix.
    #[must_use]
    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self::Heartbeat {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Wrap a message payload.
    #[must_use]
    pub const fn message(data: Value) -> Self {
        Self::Message { data }
    }

    /// Event kind as it appears in the `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Message { .. } => "message",
        }
    }

    /// Serialize to the JSON text sent over the wire.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_connection_framing() {
        let value = serde_json::to_value(LiveEvent::connection()).unwrap();
        assert_eq!(
            value,
            json!({"type": "connection", "message": "Connected to WhatsApp message stream"})
        );
    }

    #[test]
    fn test_heartbeat_framing() {
        let at = DateTime::parse_from_rfc3339("2025-02-28T15:45:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = LiveEvent::heartbeat(at).to_json().unwrap();
        assert_eq!(json, r#"{"type":"heartbeat","timestamp":"2025-02-28T15:45:00.123Z"}"#);
    }

    #[test]
    fn test_message_framing() {
        let event = LiveEvent::message(json!({"id": "1", "text": "hi"}));
        assert_eq!(event.kind(), "message");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "message", "data": {"id": "1", "text": "hi"}})
        );
    }
}
