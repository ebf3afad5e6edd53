//! Background workers — periodic tasks running alongside the server.

pub mod audit_pruner;
pub mod heartbeat_monitor;
pub mod release_intake;

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::ws::ratelimit;
use crate::AppState;

/// Start all background worker tasks. Returns handles that can be
/// used to abort them on shutdown.
pub fn start_all_workers(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    vec![
        release_intake::start(state.clone()),
        heartbeat_monitor::start(state.clone()),
        audit_pruner::start(state.clone()),
        ratelimit::start_sweeper(state.limiter.clone()),
    ]
}
