//! Request and response bodies, and the WebSocket control messages.

use chat_relay_core::UserId;
use chat_relay_session::{ChallengeStatus, InitializeOutcome, TeardownOutcome};
use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Message from a WebSocket viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ping for keepalive.
    Ping,
}

/// Control message to a WebSocket viewer. Live events are sent as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Pong response.
    Pong,
    /// Error message.
    Error { message: String },
}

/// `POST /whatsapp/initialize` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub user_id: String,
}

impl InitializeRequest {
    /// # Errors
    /// Returns `BadRequest` if the user id is blank.
    pub fn validate(&self) -> Result<UserId, ApiError> {
        non_empty("userId", &self.user_id).map(UserId::new)
    }
}

/// `POST /whatsapp/send` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    /// User whose session sends the message.
    pub from: String,
    pub to: String,
    pub text: String,
}

impl SendMessageRequest {
    /// # Errors
    /// Returns `BadRequest` if any field is blank.
    pub fn validate(&self) -> Result<UserId, ApiError> {
        non_empty("to", &self.to)?;
        non_empty("text", &self.text)?;
        non_empty("from", &self.from).map(UserId::new)
    }
}

fn non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    if value.trim().is_empty() {
        Err(ApiError::BadRequest(format!("{field} should not be empty")))
    } else {
        Ok(value)
    }
}

/// `{ "message": ... }` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn initialized(user_id: &UserId, outcome: InitializeOutcome) -> Self {
        match outcome {
            InitializeOutcome::Started => Self::new(format!("Session initialized for {user_id}")),
            InitializeOutcome::AlreadyLoggedIn => Self::new(ALREADY_LOGGED_IN),
            InitializeOutcome::InProgress => {
                Self::new(format!("Session initialization already in progress for {user_id}"))
            }
        }
    }

    #[must_use]
    pub fn torn_down(user_id: &UserId, outcome: TeardownOutcome) -> Self {
        match outcome {
            TeardownOutcome::NoSession => Self::new("No active session to logout."),
            TeardownOutcome::Completed(_) => Self::new(format!("User {user_id} logged out.")),
        }
    }
}

const ALREADY_LOGGED_IN: &str = "User is already logged in.";

/// `GET /whatsapp/qr/{userId}` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChallengeBody {
    Available {
        #[serde(rename = "qrCode")]
        qr_code: String,
    },
    AlreadyAuthenticated {
        message: String,
    },
    Unavailable {
        error: String,
    },
}

impl From<ChallengeStatus> for ChallengeBody {
    fn from(status: ChallengeStatus) -> Self {
        match status {
            ChallengeStatus::Available(qr_code) => Self::Available { qr_code },
            ChallengeStatus::AlreadyAuthenticated => Self::AlreadyAuthenticated {
                message: ALREADY_LOGGED_IN.to_string(),
            },
            ChallengeStatus::Unavailable => Self::Unavailable {
                error: "No QR Code available. Call initializeSession first.".to_string(),
            },
        }
    }
}
