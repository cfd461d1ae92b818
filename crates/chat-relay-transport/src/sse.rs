//! Server-sent events live stream.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use chat_relay_core::{LiveEvent, UserId};
use futures::{Stream, StreamExt};

use crate::AppState;

/// Wrap a live event as one SSE `data:` frame.
#[must_use]
pub fn to_sse_event(event: &LiveEvent) -> Option<Event> {
    match event.to_json() {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::error!("Failed to serialize live event: {e}");
            None
        }
    }
}

/// `GET /whatsapp/messages/stream/{userId}`.
///
/// The live stream is released when the client disconnects and axum drops
/// the response body.
pub async fn stream_messages(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user_id = UserId::new(user_id);
    tracing::info!(user_id = %user_id, "SSE viewer connected");

    let live = state.streams.open(&user_id);
    Sse::new(live.filter_map(|event| async move { to_sse_event(&event).map(Ok) }))
}
