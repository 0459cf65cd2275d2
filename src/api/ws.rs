// WebSocket handler: one session per connection, one context update per text frame.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::{apply_update, ApiError, AppState};
use crate::metrics;
use crate::protocol::{decode_update, ServerMessage};
use crate::session::SessionLease;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler for context sessions.
///
/// A session id can be bound to one socket at a time; a second upgrade for the
/// same id is refused with 409.
pub async fn ws_session(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let session_id = params
        .session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let Some(lease) = state.sessions.lease(&session_id) else {
        tracing::warn!(session_id = %session_id, "Rejected WebSocket for a session in use");
        return ApiError::SessionInUse(session_id).into_response();
    };
    ws.on_upgrade(move |socket| handle_ws(socket, state, lease))
}

async fn handle_ws(mut socket: WebSocket, state: AppState, lease: SessionLease) {
    let session_id = lease.session_id().to_string();
    metrics::CONNECTED_WEBSOCKETS.inc();
    tracing::info!(session_id = %session_id, "WebSocket client connected");

    let hello = ServerMessage::Hello {
        session_id: session_id.clone(),
    };
    if send(&mut socket, &hello).await {
        while let Some(result) = socket.recv().await {
            let reply = match result {
                Ok(Message::Text(text)) => handle_text(&state, &session_id, text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    ServerMessage::error("invalid_payload", "binary frames are not supported")
                }
                Ok(Message::Close(_)) => break,
                // Ping/pong are answered by the transport
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(session_id = %session_id, "WebSocket receive error: {e}");
                    break;
                }
            };
            if !send(&mut socket, &reply).await {
                // Client disconnected
                break;
            }
        }
    }

    // Sessions that existed before this socket bound them outlive it
    if lease.owns_session() {
        state.rate_limiter.release(&session_id);
    }
    drop(lease);
    metrics::CONNECTED_WEBSOCKETS.dec();
    tracing::info!(session_id = %session_id, "WebSocket client disconnected");
}

async fn handle_text(state: &AppState, session_id: &str, text: &str) -> ServerMessage {
    let result = match decode_update(text) {
        Ok(update) => apply_update(state, session_id, update).await,
        Err(e) => Err(ApiError::from(e)),
    };
    match result {
        Ok(reply) => ServerMessage::Response {
            session_id: reply.session_id,
            warnings: reply.warnings,
            response: reply.response,
        },
        Err(e) => ServerMessage::error(e.kind(), &e),
    }
}

/// Send a message; returns false if the client is gone.
async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    if socket.send(Message::Text(msg.to_json().into())).await.is_err() {
        return false;
    }
    metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
    true
}
