//! Signing-key admin API.
//!
//! GET  /api/keys         — sanitized key listing (no private material)
//! POST /api/keys/rotate  — create + activate a fresh key, then re-sign
//!                          every stored manifest under it

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use pm_common::AppResult;

use crate::store::SigningKeyInfo;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list_keys))
        .route("/rotate", post(rotate_key))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<SigningKeyInfo>>> {
    Ok(Json(state.keys.list(q.limit).await?))
}

#[derive(Debug, Default, Deserialize)]
struct RotateQuery {
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Serialize)]
struct RotateResponse {
    key: SigningKeyInfo,
    regenerated_manifests: usize,
}

async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Query(req): Query<RotateQuery>,
) -> AppResult<Json<RotateResponse>> {
    let key = state.signer.rotate_key(&req.notes).await?;
    let regenerated = state.signer.regenerate_manifests().await?;

    state
        .audit
        .record(
            None,
            "signing_key_rotated",
            Some(serde_json::json!({
                "key_id": key.id,
                "regenerated_manifests": regenerated,
            })),
        )
        .await?;

    Ok(Json(RotateResponse {
        key,
        regenerated_manifests: regenerated,
    }))
}
