//! WebSocket gateway: the agent control channel and the UI event stream.

pub mod client_ip;
mod events;
mod handler;
pub mod hub;
pub mod ratelimit;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/agent", axum::routing::get(handler::agent_ws_handler))
        .route("/events", axum::routing::get(events::events_ws_handler))
        .with_state(state)
}
