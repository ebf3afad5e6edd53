//! API routes module.

mod agents;
mod artifacts;
mod audit;
mod health;
mod keys;
mod manifests;
mod policy;
mod telemetry;

use crate::AppState;
use axum::Router;
use std::sync::Arc;

/// Build the API router with all sub-routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/agents", agents::router(state.clone()))
        .nest("/manifests", manifests::router(state.clone()))
        .nest("/artifacts", artifacts::router(state.clone()))
        .nest("/keys", keys::router(state.clone()))
        .nest("/policy", policy::router(state.clone()))
        .nest("/telemetry", telemetry::router(state.clone()))
        .nest("/audit", audit::router(state))
        .merge(health::router())
}
