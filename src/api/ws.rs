// WebSocket handler for live match frames.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};

use crate::metrics;

use super::AppState;

/// WebSocket upgrade handler for spectating the running match.
pub async fn ws_match(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    metrics::CONNECTED_WEBSOCKETS.inc();
    forward_frames(socket, state).await;
    metrics::CONNECTED_WEBSOCKETS.dec();
}

async fn forward_frames(mut socket: WebSocket, state: AppState) {
    let mut rx = state.match_server.subscribe();

    // Late joiners get the last frame straight away.
    if let Some(frame) = state.match_server.latest_frame() {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
        metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if socket.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                        metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Spectator lagged, skipped {n} messages");
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
