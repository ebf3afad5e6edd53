//! Agent inventory and diagnostics API.
//!
//! GET  /api/agents              — inventory listing with live-session flag
//! GET  /api/agents/{id}         — one agent + connection diagnostics
//! POST /api/agents/{id}/query   — proxy a request over the agent's control
//!                                 channel and return its reply

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use pm_common::{AppError, AppResult};

use crate::store::agents::AgentRow;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list_agents))
        .route("/{id}", get(get_agent))
        .route("/{id}/query", post(query_agent))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
struct AgentView {
    #[serde(flatten)]
    row: AgentRow,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct AgentDetail {
    #[serde(flatten)]
    row: AgentRow,
    connected: bool,
    ping_failures: u64,
    disconnects: u64,
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<AgentView>>> {
    let rows = state.agents.list(q.limit).await?;
    let views = rows
        .into_iter()
        .map(|row| AgentView {
            connected: state.hub.is_connected(&row.id),
            row,
        })
        .collect();
    Ok(Json(views))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<AgentDetail>> {
    let row = state
        .agents
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no such agent: {id}")))?;

    let (ping_failures, disconnects) = state.hub.counters(&id);
    Ok(Json(AgentDetail {
        connected: state.hub.is_connected(&row.id),
        ping_failures,
        disconnects,
        row,
    }))
}

async fn query_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    let reply = state
        .hub
        .proxy_request(&id, payload)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(reply))
}
