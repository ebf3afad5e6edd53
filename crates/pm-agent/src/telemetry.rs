//! Update telemetry shipping.
//!
//! Reports are fire-and-forget: dispatched on their own task so a failing or
//! shutting-down run can never block on delivery, and never retried — the
//! next phase transition re-reports anyway.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use pm_protocol::{msg, UpdateReport, WsMessage};

pub trait TelemetrySink: Send + Sync {
    fn report(&self, report: UpdateReport);
}

/// Production sink: prefers the live control channel, falls back to the
/// HTTP telemetry endpoint when no session is up.
pub struct ControlChannelSink {
    /// Writer of the current control-channel session, if any.
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ControlChannelSink {
    pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
        Ok(Self {
            slot: Arc::new(Mutex::new(None)),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Handle the connection task uses to publish the current session writer.
    pub fn writer_slot(&self) -> Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>> {
        Arc::clone(&self.slot)
    }
}

impl TelemetrySink for ControlChannelSink {
    fn report(&self, report: UpdateReport) {
        let data = match serde_json::to_value(&report) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Telemetry report serialization failed, dropping: {e}");
                return;
            }
        };

        // Over the live session when there is one.
        if let Some(tx) = self.slot.lock().unwrap().as_ref() {
            if tx.send(WsMessage::new(msg::UPDATE_PROGRESS, data.clone())).is_ok() {
                return;
            }
        }

        // No session (e.g. mid-restart): one HTTP attempt, then drop.
        let http = self.http.clone();
        let url = format!("{}/api/telemetry", self.base_url);
        let token = self.token.clone();
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .bearer_auth(&token)
                .json(&data)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::debug!("Telemetry POST returned HTTP {}, dropped", resp.status())
                }
                Err(e) => tracing::debug!("Telemetry POST failed, dropped: {e}"),
            }
        });
    }
}
