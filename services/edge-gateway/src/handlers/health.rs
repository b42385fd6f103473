use axum::extract::State;
use axum::http::StatusCode;

use crate::AppState;

/// Liveness probe. Used by the orchestrator's liveness check.
pub async fn health() -> &'static str {
    "ok"
}

/// Readiness probe: confirms the coordination store is actually reachable
/// rather than just the process being up.
pub async fn readiness(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    state
        .store
        .list_services()
        .await
        .map(|_| "ready")
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(health().await, "ok");
    }
}
