use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// Parses `cache:{host_id}:{dimension_id}:{fp_hex}` back into its parts.
/// The coordination-store metadata hash is shared across every EG node
/// (§4.4, §4.6); only the artifact bytes are local to whichever node
/// rendered or already pulled them, which is exactly what this endpoint
/// exchanges.
fn parse_cache_key(cache_key: &str) -> Option<(u64, u64, u64)> {
    let mut parts = cache_key.split(':');
    if parts.next()? != "cache" {
        return None;
    }
    let host_id = parts.next()?.parse().ok()?;
    let dimension = parts.next()?.parse().ok()?;
    let fp = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((host_id, dimension, fp))
}

/// `POST /internal/replicate/{cache_key}` (§4.6): a peer pushing a
/// just-rendered artifact to this node. The metadata for `cache_key` is
/// already visible through the shared coordination store; this only needs
/// to land the bytes on local disk under the entry's existing path.
pub async fn push_replica(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
    body: Bytes,
) -> Response {
    let Some((host_id, dimension, fp)) = parse_cache_key(&cache_key) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.cache.entry_metadata(host_id, dimension, fp).await {
        Ok(Some(entry)) => match state.cache.adopt_pulled_artifact(&entry, &body).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => {
                tracing::warn!(error = %e, cache_key, "failed to adopt replicated artifact");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, cache_key, "replication push lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /internal/replicate/{cache_key}` (§4.6): a peer pulling an
/// artifact this node holds. Expired entries are refused with `404` so the
/// puller re-renders instead of retrying a dead replica.
pub async fn pull_replica(State(state): State<AppState>, Path(cache_key): Path<String>) -> Response {
    let Some((host_id, dimension, fp)) = parse_cache_key(&cache_key) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.cache.entry_metadata(host_id, dimension, fp).await {
        Ok(Some(entry)) if gateway_core::cache_manager::system_clock() <= entry.expires_at => {
            match state.cache.read_artifact(&entry).await {
                Ok(bytes) => bytes.into_response(),
                Err(e) => {
                    tracing::warn!(error = %e, cache_key, "failed to read artifact for replication pull");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Ok(_) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(error = %e, cache_key, "replication pull lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
