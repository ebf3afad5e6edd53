//! Artifact download endpoint.
//!
//! Serves cached release artifacts by filename, with `Range: bytes=N-`
//! support so agents can resume interrupted downloads. Only filenames
//! matching the printmaster asset pattern are served.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::services::intake::parse_asset_name;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{filename}", get(download_artifact))
        .with_state(state)
}

/// Parse `bytes=N-` into an offset. Suffix and multi-range forms are not
/// supported; agents only resume from a byte offset.
fn parse_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, rest) = spec.split_once('-')?;
    if !rest.is_empty() {
        return None;
    }
    start.parse().ok()
}

async fn download_artifact(
    Path(filename): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    // Asset-pattern parse doubles as the path traversal guard.
    let Some(parts) = parse_asset_name(&filename) else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    let file_path = std::path::PathBuf::from(&state.config.releases.cache_dir)
        .join(parts.component)
        .join(parts.version)
        .join(&filename);

    let data = match tokio::fs::read(&file_path).await {
        Ok(d) => d,
        Err(_) => {
            tracing::warn!("Artifact not found: {}", file_path.display());
            return (StatusCode::NOT_FOUND, "Artifact not found").into_response();
        }
    };
    let total = data.len() as u64;

    match parse_range_start(&headers) {
        Some(start) if start < total => {
            let body = data[start as usize..].to_vec();
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, body.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, total - 1, total),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from(body))
                .unwrap()
                .into_response()
        }
        Some(_) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{total}"))],
        )
            .into_response(),
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            )
            .header(header::CONTENT_LENGTH, total)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from(data))
            .unwrap()
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::RANGE, value.parse().unwrap());
        map
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range_start(&range("bytes=8-")), Some(8));
        assert_eq!(parse_range_start(&range("bytes=0-")), Some(0));
        assert_eq!(parse_range_start(&range("bytes=0-100")), None);
        assert_eq!(parse_range_start(&range("items=8-")), None);
        assert_eq!(parse_range_start(&HeaderMap::new()), None);
    }
}
