//! API error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chat_relay_session::RegistryError;
use serde_json::json;

/// Error returned by an API handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Registry(RegistryError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Registry(RegistryError::NotReady(_)) => StatusCode::CONFLICT,
            Self::Registry(RegistryError::ExternalClient { .. }) => StatusCode::BAD_GATEWAY,
            Self::Registry(RegistryError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        } else {
            tracing::debug!("Request rejected: {self}");
        }

        let message = match &self {
            Self::Registry(RegistryError::SessionNotFound(user_id)) => {
                format!("No active WhatsApp session for userId: {user_id}")
            }
            other => other.to_string(),
        };
        (
            status,
            Json(json!({
                "statusCode": status.as_u16(),
                "message": message,
                "error": status.canonical_reason().unwrap_or("Error"),
            })),
        )
            .into_response()
    }
}
