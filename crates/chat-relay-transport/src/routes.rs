//! JSON API routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{delete, get, post},
};
use chat_relay_core::{MessageRecord, StreamManager, UserId};
use chat_relay_session::{ChatList, ChatMessageView, ContactView, SessionRegistry};
use tower_http::trace::TraceLayer;

use crate::{
    ApiError,
    protocol::{ChallengeBody, InitializeRequest, MessageBody, SendMessageRequest},
    sse,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub streams: StreamManager,
}

impl AppState {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, streams: StreamManager) -> Self {
        Self { registry, streams }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the `/whatsapp` router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let whatsapp = Router::new()
        .route("/initialize", post(initialize))
        .route("/qr/{user_id}", get(challenge))
        .route("/send", post(send_message))
        .route("/messages/{user_id}", get(list_messages))
        .route("/messages/{user_id}/{chat_id}", get(chat_messages))
        .route("/messages/stream/{user_id}", get(sse::stream_messages))
        .route("/chats/{user_id}", get(list_chats))
        .route("/user/{user_id}/{contact_id}", get(contact))
        .route("/contacts/{user_id}", get(contacts))
        .route("/logout/{user_id}", delete(logout))
        .route("/destroy/{user_id}", delete(destroy));

    #[cfg(feature = "websocket")]
    let whatsapp = whatsapp.route("/ws/{user_id}", get(crate::websocket::ws_handler));

    Router::new()
        .nest("/whatsapp", whatsapp)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

async fn initialize(
    State(state): State<AppState>,
    payload: Result<Json<InitializeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageBody>), ApiError> {
    let user_id = body(payload)?.validate()?;
    let outcome = state.registry.initialize(&user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageBody::initialized(&user_id, outcome)),
    ))
}

async fn challenge(State(state): State<AppState>, Path(user_id): Path<String>) -> Json<ChallengeBody> {
    Json(state.registry.challenge(&UserId::new(user_id)).into())
}

async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageRecord>), ApiError> {
    let request = body(payload)?;
    let user_id = request.validate()?;
    let record = state
        .registry
        .send_message(&user_id, &request.to, &request.text)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<MessageRecord>> {
    Ok(Json(state.registry.list_messages(&UserId::new(user_id)).await?))
}

async fn chat_messages(
    State(state): State<AppState>,
    Path((user_id, chat_id)): Path<(String, String)>,
) -> ApiResult<Vec<ChatMessageView>> {
    Ok(Json(
        state
            .registry
            .chat_messages(&UserId::new(user_id), &chat_id)
            .await?,
    ))
}

async fn list_chats(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<ChatList> {
    Ok(Json(state.registry.list_chats(&UserId::new(user_id)).await?))
}

async fn contact(
    State(state): State<AppState>,
    Path((user_id, contact_id)): Path<(String, String)>,
) -> ApiResult<ContactView> {
    Ok(Json(
        state
            .registry
            .contact(&UserId::new(user_id), &contact_id)
            .await?,
    ))
}

async fn contacts(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<ContactView>> {
    Ok(Json(state.registry.contacts(&UserId::new(user_id)).await?))
}

async fn logout(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<MessageBody> {
    let user_id = UserId::new(user_id);
    let outcome = state.registry.logout(&user_id).await?;
    Ok(Json(MessageBody::torn_down(&user_id, outcome)))
}

async fn destroy(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult<MessageBody> {
    let user_id = UserId::new(user_id);
    let outcome = state.registry.destroy(&user_id).await?;
    Ok(Json(MessageBody::torn_down(&user_id, outcome)))
}
