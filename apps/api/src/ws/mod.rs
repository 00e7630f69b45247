//! WebSocket endpoint for real-time run/step events
//!
//! `GET /ws?token=<apiToken>` upgrades; the server pushes event frames
//! filtered to the authenticated principal. Client frames are ignored.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use tokio::sync::broadcast::error::RecvError;

use foreman_domain::UserId;

use crate::extractors::CurrentUser;
use crate::AppState;

async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = user.user_id();
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, principal: UserId) {
    let mut events = state.hub.subscribe(principal).await;
    tracing::debug!(principal = %principal, "websocket connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(envelope) => {
                    let Ok(frame) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(principal = %principal, skipped, "websocket subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                // Client frames carry no protocol; drop them
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state.hub.cleanup(principal).await;
    tracing::debug!(principal = %principal, "websocket disconnected");
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}
