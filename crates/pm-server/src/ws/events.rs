//! Event stream for UIs — forwards hub events (agent connect/disconnect,
//! update progress) to any connected subscriber as JSON text frames.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};

use crate::AppState;

pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.hub.subscribe();

    tracing::debug!(
        agent_sessions = state.hub.session_count(),
        "Event subscriber connected"
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(value) => {
                        if sender.send(Message::Text(value.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Event subscriber lagged");
                    }
                    Err(_) => break,
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("Event subscriber disconnected");
}
