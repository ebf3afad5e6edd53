//! Audit log API — paginated query.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use pm_common::AppResult;

use crate::store::audit::AuditEntry;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/", get(list_audit_log)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_audit_log(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuditQuery>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.audit.list(q.limit, q.offset).await?))
}
