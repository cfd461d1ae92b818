//! WebSocket live stream.
//!
//! Same frames as the SSE stream, one JSON text message each. The viewer
//! may send `{"type":"ping"}` and gets `{"type":"pong"}` back.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chat_relay_core::UserId;
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use crate::{
    AppState,
    protocol::{ClientMessage, ServerMessage},
};

/// `GET /whatsapp/ws/{userId}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let user_id = UserId::new(user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

fn text_frame<T: Serialize>(msg: &T) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            None
        }
    }
}

/// Answer to one inbound frame, if any.
fn reply(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
        Err(e) => {
            tracing::warn!("Invalid client message: {e}");
            Some(ServerMessage::Error {
                message: format!("Invalid message: {e}"),
            })
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    tracing::info!(user_id = %user_id, "WebSocket viewer connected");
    let (mut sender, mut receiver) = socket.split();
    let mut live = state.streams.open(&user_id);

    loop {
        let outgoing = tokio::select! {
            event = live.next() => match event {
                Some(event) => text_frame(&event),
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => reply(text.as_str()).and_then(|r| text_frame(&r)),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => reply(text).and_then(|r| text_frame(&r)),
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {e}");
                    break;
                }
            },
        };

        if let Some(frame) = outgoing {
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    }

    live.close();
    tracing::info!(user_id = %user_id, "WebSocket viewer disconnected");
}
