//! Fleet update-policy API — the policy agents inherit unless a local
//! override is in force.
//!
//! GET /api/policy — read current fleet policy
//! PUT /api/policy — replace it

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use pm_common::{AppError, AppResult};
use pm_protocol::{msg, PolicySpec, WsMessage};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(get_policy).put(set_policy))
        .with_state(state)
}

async fn get_policy(State(state): State<Arc<AppState>>) -> AppResult<Json<PolicySpec>> {
    let policy = state.agents.fleet_policy().await?.unwrap_or_default();
    Ok(Json(policy))
}

async fn set_policy(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<PolicySpec>,
) -> AppResult<Json<PolicySpec>> {
    if let Some(window) = &policy.maintenance_window {
        if window.start_hour > 23 || window.end_hour > 23 || window.start_min > 59 || window.end_min > 59 {
            return Err(AppError::BadRequest("maintenance window out of range".into()));
        }
        if window.days_of_week.iter().any(|d| *d > 6) {
            return Err(AppError::BadRequest("days_of_week must be 0-6".into()));
        }
    }

    state.agents.set_fleet_policy(&policy).await?;

    // Connected agents learn immediately; everyone else on next heartbeat.
    state.hub.broadcast_event(serde_json::json!({
        "type": msg::POLICY_UPDATE,
        "policy": policy,
    }));
    let message = WsMessage::new(
        msg::POLICY_UPDATE,
        serde_json::json!({ "policy": policy, "source": "fleet" }),
    );
    state.hub.broadcast_to_agents(&message);

    tracing::info!(
        update_check_days = policy.update_check_days,
        "Fleet update policy saved"
    );
    Ok(Json(policy))
}
