//! Update telemetry ingest over HTTP.
//!
//! The normal path for status events is the control channel; this endpoint
//! catches reports from agents between sessions (e.g. right after a restart
//! into a new binary). Bearer-token authenticated.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};

use pm_common::{AppError, AppResult};
use pm_protocol::{msg, UpdateReport};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(ingest_report))
        .with_state(state)
}

async fn ingest_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(report): Json<UpdateReport>,
) -> AppResult<Json<serde_json::Value>> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    if state.agents.validate_token(token).await?.is_none() {
        return Err(AppError::Unauthorized("invalid agent token".into()));
    }

    let payload = serde_json::to_value(&report)
        .map_err(|e| anyhow::anyhow!("serialize update report: {e}"))?;

    state
        .audit
        .record(Some(&report.agent_id), "update_progress", Some(payload.clone()))
        .await?;

    let mut event = payload;
    event["type"] = serde_json::json!(msg::UPDATE_PROGRESS);
    state.hub.broadcast_event(event);

    Ok(Json(serde_json::json!({ "accepted": true })))
}
