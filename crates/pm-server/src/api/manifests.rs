//! Latest-manifest query endpoint.
//!
//! Agents ask for the newest signed manifest matching their identity:
//!   GET /api/manifests/latest?component={c}&platform={p}&arch={a}&channel={ch}

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use pm_common::AppResult;
use pm_protocol::SignedManifest;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/latest", get(latest_manifest))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    component: String,
    platform: String,
    arch: String,
    #[serde(default)]
    channel: String,
}

async fn latest_manifest(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LatestQuery>,
) -> AppResult<Json<SignedManifest>> {
    let manifest = state
        .query
        .get_latest(&q.component, &q.platform, &q.arch, &q.channel)
        .await?;
    Ok(Json(manifest))
}
