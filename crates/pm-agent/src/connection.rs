//! Control-channel client.
//!
//! Maintains one authenticated WebSocket session to the server: a writer
//! task draining outbound messages, a heartbeat task shipping host metrics,
//! and the reader loop handling pongs, fleet-policy pushes, and proxied
//! requests. Reconnects with capped exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use pm_protocol::{msg, Heartbeat, PolicySpec, UpdateStatus, WsMessage};

use crate::policy::SharedPolicy;
use crate::update::manager::UpdateManager;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Shared slot the telemetry sink reads the current session writer from.
pub type WriterSlot = Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>;

pub struct Connection {
    pub server_url: String,
    pub token: String,
    pub agent_id: String,
    pub shared_policy: Arc<SharedPolicy>,
    pub writer_slot: WriterSlot,
    pub manager: Arc<UpdateManager>,
}

impl Connection {
    /// Connect-and-run forever. Never returns under normal operation.
    pub async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let url = format!(
                "{}?token={}&agent_id={}",
                self.server_url, self.token, self.agent_id
            );
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    tracing::info!("Control channel connected");
                    backoff = INITIAL_BACKOFF;
                    self.run_session(stream).await;
                    tracing::warn!("Control channel session ended");
                }
                Err(e) => {
                    tracing::warn!("Control channel connect failed: {e}");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_session(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut ws_write, mut ws_read) = stream.split();

        // Outbound channel shared with the heartbeat task and telemetry sink.
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.writer_slot.lock().unwrap() = Some(tx.clone());

        // Writer task: serialize and push frames.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeat task. Interval can be retuned by the server via pong.
        let heartbeat_secs = Arc::new(AtomicU64::new(DEFAULT_HEARTBEAT_SECS));
        let heartbeat = {
            let tx = tx.clone();
            let agent_id = self.agent_id.clone();
            let secs = Arc::clone(&heartbeat_secs);
            tokio::spawn(async move {
                loop {
                    let hb = collect_heartbeat(&agent_id);
                    if tx.send(WsMessage::new(
                        msg::HEARTBEAT,
                        serde_json::to_value(&hb).unwrap_or_default(),
                    ))
                    .is_err()
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(secs.load(Ordering::Relaxed))).await;
                }
            })
        };

        // Reader loop.
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<WsMessage>(&text) {
                        Ok(message) => {
                            self.dispatch(&tx, &heartbeat_secs, message);
                        }
                        Err(e) => tracing::warn!("Malformed server message: {e}"),
                    }
                }
                Ok(Message::Ping(_)) => {
                    // tungstenite queues the pong on the write half.
                }
                Ok(Message::Close(_)) => {
                    tracing::info!("Server closed control channel");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Control channel read error: {e}");
                    break;
                }
                _ => {}
            }
        }

        self.writer_slot.lock().unwrap().take();
        writer.abort();
        heartbeat.abort();
    }

    fn dispatch(
        &self,
        tx: &mpsc::UnboundedSender<WsMessage>,
        heartbeat_secs: &AtomicU64,
        message: WsMessage,
    ) {
        match message.kind.as_str() {
            msg::PONG => {
                if let Some(interval) = message.data.get("interval_secs").and_then(|v| v.as_u64())
                {
                    if interval > 0 {
                        heartbeat_secs.store(interval, Ordering::Relaxed);
                    }
                }
                self.absorb_policy(&message);
            }
            msg::POLICY_UPDATE => self.absorb_policy(&message),
            msg::PROXY_REQUEST => {
                let Some(request_id) = message.get_str("request_id") else {
                    return;
                };
                let reply = WsMessage::new(
                    msg::PROXY_RESPONSE,
                    serde_json::json!({
                        "request_id": request_id,
                        "payload": self.status_payload(),
                    }),
                );
                let _ = tx.send(reply);
            }
            msg::ERROR => {
                tracing::warn!(
                    "Server reported error: {}",
                    message.get_str("message").unwrap_or("<none>")
                );
            }
            other => tracing::debug!(kind = %other, "Unhandled server message"),
        }
    }

    /// Fleet policy arrives on pong and on policy_update pushes; absent or
    /// null means the server has no fleet policy.
    fn absorb_policy(&self, message: &WsMessage) {
        if let Some(value) = message.data.get("policy") {
            let policy: Option<PolicySpec> = serde_json::from_value(value.clone()).ok().flatten();
            self.shared_policy.set_fleet(policy);
        }
    }

    fn status_payload(&self) -> serde_json::Value {
        let status: UpdateStatus = self.manager.status();
        serde_json::json!({
            "agent_id": self.agent_id,
            "agent_version": env!("CARGO_PKG_VERSION"),
            "update_status": status,
            "latest_known_version": self.manager.latest_version(),
            "latest_manifest_url": self.manager.latest_manifest().map(|(_, url)| url),
            "last_check": self.manager.last_check(),
        })
    }
}

fn collect_heartbeat(agent_id: &str) -> Heartbeat {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let (disk_used, disk_total) = disks
        .iter()
        .map(|d| (d.total_space() - d.available_space(), d.total_space()))
        .fold((0u64, 0u64), |(u, t), (du, dt)| (u + du, t + dt));

    Heartbeat {
        agent_id: agent_id.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: sysinfo::System::host_name().unwrap_or_default(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_usage: sys.global_cpu_usage() as f64,
        memory_used: sys.used_memory(),
        memory_total: sys.total_memory(),
        disk_used,
        disk_total,
        uptime_secs: sysinfo::System::uptime(),
    }
}
