//! Fleet liveness sweep.
//!
//! The control channel flips an agent offline when its session closes, but
//! a session can die without a close frame ever arriving. Every 30 seconds
//! this worker expires online agents whose last_seen is more than 90
//! seconds stale and broadcasts the disconnect on the hub.

use std::sync::Arc;
use tokio::task::JoinHandle;

use pm_protocol::msg;

use crate::AppState;

const CHECK_INTERVAL_SECS: u64 = 30;
const TIMEOUT_SECS: i64 = 90;

pub fn start(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(CHECK_INTERVAL_SECS));

        tracing::info!(
            interval_secs = CHECK_INTERVAL_SECS,
            timeout_secs = TIMEOUT_SECS,
            "Heartbeat monitor started"
        );

        loop {
            interval.tick().await;

            let stale = match state.agents.expire_stale(TIMEOUT_SECS).await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!("Heartbeat monitor query failed: {e}");
                    continue;
                }
            };

            if !stale.is_empty() {
                tracing::info!(count = stale.len(), "Expired agents with stale heartbeats");
                for id in &stale {
                    state.hub.broadcast_event(serde_json::json!({
                        "type": msg::AGENT_DISCONNECTED,
                        "agent_id": id,
                        "reason": "heartbeat_timeout",
                    }));
                }
            }
        }
    })
}
