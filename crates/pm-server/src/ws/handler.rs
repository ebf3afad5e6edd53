//! Agent control-channel handler.
//!
//! Authenticates the upgrade (token query parameter against stored hashes,
//! behind the rate limiter), then runs one session: a writer task draining
//! an mpsc channel with a per-frame deadline, a ping task watching pong
//! liveness, and the reader loop dispatching typed JSON messages.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use pm_common::{AppError, AppResult};
use pm_protocol::{msg, Heartbeat, WsMessage};

use crate::ws::ratelimit;
use crate::AppState;

/// Interval between server-initiated pings.
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Per-frame write deadline; a pong must also arrive within
/// `PING_INTERVAL + WRITE_DEADLINE` of the last one.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Storage operations under the channel get this long before the
/// connection gives up on them.
const STORE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period before a closed session marks the agent offline.
const OFFLINE_DEBOUNCE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    token: String,
    /// Agent-supplied id, used when the token is a fleet enrollment token
    /// not bound to a specific agent.
    #[serde(default)]
    agent_id: Option<String>,
}

async fn with_store_timeout<T, F>(fut: F) -> AppResult<T>
where
    F: std::future::Future<Output = AppResult<T>>,
{
    tokio::time::timeout(STORE_TIMEOUT, fut)
        .await
        .map_err(|_| AppError::Internal(anyhow::anyhow!("storage operation timed out")))?
}

/// Agent WebSocket upgrade with token auth and rate limiting.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<AgentWsQuery>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let ip = state.ip_resolver.resolve(peer.ip(), &headers);
    let prefix = ratelimit::token_prefix(&params.token);

    if state.limiter.is_blocked(ip, &prefix) {
        return Err(AppError::TooManyRequests(
            "authentication temporarily blocked".into(),
        ));
    }

    let bound = with_store_timeout(state.agents.validate_token(&params.token)).await?;
    let Some(bound_agent) = bound else {
        let newly_blocked = state.limiter.record_failure(ip, &prefix);
        if newly_blocked {
            let _ = state
                .audit
                .record(
                    None,
                    "auth_rate_limit_block",
                    Some(serde_json::json!({ "ip": ip.to_string(), "token_prefix": prefix })),
                )
                .await;
        }
        return Err(AppError::Unauthorized("invalid agent token".into()));
    };

    let agent_id = if !bound_agent.is_empty() {
        bound_agent
    } else {
        match params.agent_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(AppError::Unauthorized(
                    "enrollment token requires an agent_id".into(),
                ))
            }
        }
    };

    state.limiter.record_success(ip, &prefix);
    tracing::info!(%agent_id, %ip, "Agent control channel authenticated");

    Ok(ws.on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id)))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>, agent_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: multiple producers (dispatch, ping loop, hub) funnel
    // through one channel; every frame gets a write deadline.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match tokio::time::timeout(WRITE_DEADLINE, ws_sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("Control channel write failed: {e}");
                    break;
                }
                Err(_) => {
                    tracing::warn!("Control channel write deadline exceeded");
                    break;
                }
            }
        }
    });

    let epoch = state.hub.register(&agent_id, tx.clone());

    // Initial fleet policy push.
    if let Ok(Some(policy)) = with_store_timeout(state.agents.fleet_policy()).await {
        let message = WsMessage::new(
            msg::POLICY_UPDATE,
            serde_json::json!({ "policy": policy, "source": "fleet" }),
        );
        if let Ok(text) = serde_json::to_string(&message) {
            let _ = tx.send(Message::Text(text.into()));
        }
    }

    // Ping task: send a ping every 25 s; a missing pong past the deadline
    // closes the session and counts against the agent.
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let ping_task = {
        let tx = tx.clone();
        let last_pong = Arc::clone(&last_pong);
        let hub_state = Arc::clone(&state);
        let ping_agent = agent_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let since_pong = last_pong.lock().unwrap().elapsed();
                if since_pong > PING_INTERVAL + WRITE_DEADLINE {
                    tracing::warn!(agent_id = %ping_agent, ?since_pong, "Ping failure, closing session");
                    hub_state.hub.record_ping_failure(&ping_agent);
                    let _ = tx.send(Message::Close(None));
                    break;
                }
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        })
    };

    // Reader loop.
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(message) => dispatch_message(&state, &tx, &agent_id, message).await,
                Err(e) => {
                    tracing::warn!(%agent_id, "Malformed control message: {e}");
                    send_message(&tx, &WsMessage::error("malformed message"));
                }
            },
            Ok(Message::Pong(_)) => {
                *last_pong.lock().unwrap() = Instant::now();
            }
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                tracing::info!(%agent_id, "Agent closed control channel");
                break;
            }
            Err(e) => {
                tracing::warn!(%agent_id, "Control channel error: {e}");
                break;
            }
            _ => {}
        }
    }

    // ── Cleanup ──────────────────────────────────────────────
    send_task.abort();
    ping_task.abort();
    state.hub.record_disconnect(&agent_id);
    let was_current = state.hub.unregister(&agent_id, epoch);

    if was_current {
        // Debounce: a quick reconnect keeps the agent online.
        let state = Arc::clone(&state);
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(OFFLINE_DEBOUNCE).await;
            if !state.hub.is_connected(&agent_id) {
                if let Err(e) = with_store_timeout(state.agents.mark_offline(&agent_id)).await {
                    tracing::warn!(%agent_id, "Failed to mark agent offline: {e}");
                } else {
                    tracing::info!(%agent_id, "Agent marked offline");
                }
            }
        });
    }
}

async fn dispatch_message(
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<Message>,
    agent_id: &str,
    message: WsMessage,
) {
    match message.kind.as_str() {
        msg::HEARTBEAT => handle_heartbeat(state, tx, agent_id, &message).await,

        msg::PROXY_RESPONSE => {
            let Some(request_id) = message.get_str("request_id") else {
                send_message(tx, &WsMessage::error("proxy_response without request_id"));
                return;
            };
            let payload = message
                .data
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            state.hub.resolve_proxy(request_id, payload);
        }

        msg::UPDATE_PROGRESS => {
            let mut data = message.data.clone();
            data.insert("agent_id".into(), serde_json::json!(agent_id));
            let payload = serde_json::Value::Object(data);

            if let Err(e) = with_store_timeout(state.audit.record(
                Some(agent_id),
                "update_progress",
                Some(payload.clone()),
            ))
            .await
            {
                tracing::warn!(%agent_id, "Failed to record update progress: {e}");
            }

            let mut event = payload;
            event["type"] = serde_json::json!(msg::UPDATE_PROGRESS);
            state.hub.broadcast_event(event);
        }

        msg::JOB_PROGRESS => {
            let mut data = message.data.clone();
            data.insert("agent_id".into(), serde_json::json!(agent_id));
            let mut event = serde_json::Value::Object(data);
            event["type"] = serde_json::json!(msg::JOB_PROGRESS);
            state.hub.broadcast_event(event);
        }

        msg::DEVICE_DELETED => {
            let Some(device_id) = message.get_str("device_id") else {
                send_message(tx, &WsMessage::error("device_deleted without device_id"));
                return;
            };
            match with_store_timeout(state.agents.delete_device(device_id)).await {
                Ok(removed) => {
                    tracing::info!(%agent_id, %device_id, removed, "Device deletion applied");
                }
                Err(e) => tracing::warn!(%agent_id, %device_id, "Device deletion failed: {e}"),
            }
        }

        other => {
            tracing::warn!(%agent_id, kind = %other, "Unknown control message type");
            send_message(tx, &WsMessage::error(&format!("unknown message type: {other}")));
        }
    }
}

/// Update inventory from a heartbeat and reply `pong` with the current
/// heartbeat interval and fleet policy.
async fn handle_heartbeat(
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<Message>,
    agent_id: &str,
    message: &WsMessage,
) {
    let hb: Heartbeat =
        match serde_json::from_value(serde_json::Value::Object(message.data.clone())) {
            Ok(hb) => hb,
            Err(e) => {
                tracing::warn!(%agent_id, "Malformed heartbeat: {e}");
                send_message(tx, &WsMessage::error("malformed heartbeat"));
                return;
            }
        };

    if let Err(e) = with_store_timeout(state.agents.mark_online(
        agent_id,
        &hb.hostname,
        &hb.os,
        &hb.arch,
        &hb.agent_version,
    ))
    .await
    {
        tracing::warn!(%agent_id, "Heartbeat store update failed: {e}");
    }

    let policy = with_store_timeout(state.agents.fleet_policy())
        .await
        .ok()
        .flatten();

    send_message(
        tx,
        &WsMessage::new(
            msg::PONG,
            serde_json::json!({
                "interval_secs": 30,
                "policy": policy,
            }),
        ),
    );
}

fn send_message(tx: &mpsc::UnboundedSender<Message>, message: &WsMessage) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = tx.send(Message::Text(text.into()));
    }
}
