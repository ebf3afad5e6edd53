//! In-memory registry for live agent control-channel sessions.
//!
//! One `ControlHub` value per server process, threaded through `AppState`
//! so tests can instantiate parallel copies. Tracks per-agent senders,
//! pending proxy requests, liveness counters, and the out-of-band event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use pm_protocol::{msg, WsMessage};

/// Channel sender capable of pushing WS frames to a connected agent.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// How long the server waits for a proxied agent reply.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub tx: WsSender,
    /// Monotonic id distinguishing this session from a superseded one.
    pub epoch: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub ping_failures: AtomicU64,
    pub disconnects: AtomicU64,
}

pub struct ControlHub {
    /// agent_id → live session
    sessions: DashMap<String, AgentSession>,
    /// request_id → reply channel for in-flight proxy requests
    pending: DashMap<String, oneshot::Sender<serde_json::Value>>,
    /// agent_id → liveness counters (survive reconnects)
    counters: DashMap<String, ConnectionCounters>,
    events: broadcast::Sender<serde_json::Value>,
    next_epoch: AtomicU64,
}

impl Default for ControlHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            counters: DashMap::new(),
            events,
            next_epoch: AtomicU64::new(1),
        }
    }

    // ─── Session lifecycle ───────────────────────────────────

    /// Register a session, superseding (and closing) any existing one for
    /// the same agent. Returns the new session epoch.
    pub fn register(&self, agent_id: &str, tx: WsSender) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self.sessions.insert(
            agent_id.to_string(),
            AgentSession {
                agent_id: agent_id.to_string(),
                tx,
                epoch,
            },
        ) {
            tracing::info!(%agent_id, "Superseding existing control session");
            let _ = old.tx.send(Message::Close(None));
        }

        self.broadcast_event(serde_json::json!({
            "type": msg::AGENT_CONNECTED,
            "agent_id": agent_id,
        }));
        tracing::info!(%agent_id, epoch, "Agent session registered");
        epoch
    }

    /// Remove the session, but only when it is still the one identified by
    /// `epoch` — a superseding reconnect keeps its own registration.
    pub fn unregister(&self, agent_id: &str, epoch: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(agent_id, |_, session| session.epoch == epoch)
            .is_some();
        if removed {
            self.broadcast_event(serde_json::json!({
                "type": msg::AGENT_DISCONNECTED,
                "agent_id": agent_id,
            }));
            tracing::info!(%agent_id, "Agent session unregistered");
        }
        removed
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send a typed message to a connected agent.
    pub fn send_to_agent(&self, agent_id: &str, message: &WsMessage) -> bool {
        let Ok(text) = serde_json::to_string(message) else {
            return false;
        };
        match self.sessions.get(agent_id) {
            Some(session) => session.tx.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    /// Send a typed message to every connected agent.
    pub fn broadcast_to_agents(&self, message: &WsMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        for session in self.sessions.iter() {
            let _ = session.tx.send(Message::Text(text.clone().into()));
        }
    }

    // ─── Proxy requests ──────────────────────────────────────

    /// Send a `proxy_request` to the agent and await its `proxy_response`.
    pub async fn proxy_request(
        &self,
        agent_id: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let message = WsMessage::new(
            msg::PROXY_REQUEST,
            serde_json::json!({ "request_id": request_id, "payload": payload }),
        );
        if !self.send_to_agent(agent_id, &message) {
            self.pending.remove(&request_id);
            anyhow::bail!("agent {agent_id} is not connected");
        }

        match tokio::time::timeout(PROXY_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                anyhow::bail!("proxy reply channel dropped for agent {agent_id}")
            }
            Err(_) => {
                self.pending.remove(&request_id);
                anyhow::bail!("proxy request to agent {agent_id} timed out")
            }
        }
    }

    /// Route a `proxy_response` to whoever is waiting on `request_id`.
    pub fn resolve_proxy(&self, request_id: &str, value: serde_json::Value) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(%request_id, "proxy_response with no pending request");
                false
            }
        }
    }

    // ─── Liveness counters ───────────────────────────────────

    pub fn record_ping_failure(&self, agent_id: &str) {
        self.counters
            .entry(agent_id.to_string())
            .or_default()
            .ping_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, agent_id: &str) {
        self.counters
            .entry(agent_id.to_string())
            .or_default()
            .disconnects
            .fetch_add(1, Ordering::Relaxed);
    }

    /// (ping_failures, disconnects) for diagnostics.
    pub fn counters(&self, agent_id: &str) -> (u64, u64) {
        match self.counters.get(agent_id) {
            Some(c) => (
                c.ping_failures.load(Ordering::Relaxed),
                c.disconnects.load(Ordering::Relaxed),
            ),
            None => (0, 0),
        }
    }

    // ─── Event bus ───────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.events.subscribe()
    }

    pub fn broadcast_event(&self, event: serde_json::Value) {
        // Send fails only when nobody subscribes, which is fine.
        let _ = self.events.send(event);
    }
}
