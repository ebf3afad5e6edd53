//! Audit pruner — deletes audit entries past the retention window.
//!
//! Runs hourly; retention is fixed at 90 days.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::AppState;

const CHECK_INTERVAL_SECS: u64 = 3600;
const RETENTION_DAYS: i64 = 90;

pub fn start(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(CHECK_INTERVAL_SECS));

        loop {
            interval.tick().await;

            match state.audit.prune(RETENTION_DAYS).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Audit pruner removed old entries"),
                Err(e) => tracing::error!("Audit pruner failed: {e}"),
            }
        }
    })
}
