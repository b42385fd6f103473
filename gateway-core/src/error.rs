//! Error types and HTTP response conversion
//!
//! One variant per failure kind from the error taxonomy: config errors are
//! fatal at startup and never reach a handler; the rest map to the status
//! codes the client-facing `/render` surface promises.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Fatal at startup: bad host table, unresolved bot-alias reference, bad service config.
    #[error("configuration error: {0}")]
    Config(String),

    /// `render_key` missing or mismatched for the resolved host.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// SSRF guard rejected the target (private/loopback literal).
    #[error("target rejected: {0}")]
    BadTarget(String),

    /// No host matches the request's domain, or the host is disabled.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// Every RS is at tab capacity; the pipeline falls back to bypass and
    /// this is never surfaced to the client as a failure.
    #[error("no render capacity available")]
    CapacityExhausted,

    /// The RS did not respond within the per-request deadline.
    #[error("render timed out after {0:?}")]
    RenderTimeout(std::time::Duration),

    /// The RS responded with a failure (crash, navigation error, non-redirect non-2xx
    /// that the dispatcher treats as a hard failure).
    #[error("render failed: {0}")]
    RenderFailure(String),

    /// The origin fetch during a bypass failed outright (connection refused, DNS, etc).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The coordination store (Redis) is unavailable. Reads degrade to
    /// local-only; render-path writes fail.
    #[error("coordination store error: {0}")]
    Store(String),

    /// Requested artifact/metadata does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input URL; the normalizer failed but the pipeline
    /// continues with the raw URL (this variant is recorded, not thrown,
    /// in the hot path -- it is public for callers who want to fail fast).
    #[error("bad URL: {0}")]
    BadUrl(String),

    /// Unexpected internal error; must still release locks/tabs on the way out.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body returned to HTTP clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self { error: error.into(), code: None, status: status.as_u16() }
    }

    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self { error: error.into(), code: Some(code.into()), status: status.as_u16() }
    }
}

impl Error {
    /// The status code this error maps to on the client HTTP surface (§6).
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::BadTarget(_) => StatusCode::BAD_REQUEST,
            Error::UnknownHost(_) => StatusCode::UNAUTHORIZED,
            Error::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Error::RenderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RenderFailure(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadUrl(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Auth(_) => "AUTH_ERROR",
            Error::BadTarget(_) => "BAD_TARGET",
            Error::UnknownHost(_) => "UNKNOWN_HOST",
            Error::CapacityExhausted => "CAPACITY_EXHAUSTED",
            Error::RenderTimeout(_) => "RENDER_TIMEOUT",
            Error::RenderFailure(_) => "RENDER_FAILURE",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::BadUrl(_) => "BAD_URL",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                tracing::error!(error = %self, "request failed");
            }
            _ => tracing::debug!(error = %self, "request rejected"),
        }
        let body = ErrorResponse::with_code(status, self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exhausted_never_surfaces_as_client_failure_class() {
        // CapacityExhausted degrades to 503 only as a last resort (bypass
        // fallback is expected to absorb it before it reaches a handler).
        assert_eq!(Error::CapacityExhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn auth_errors_are_401() {
        assert_eq!(Error::Auth("bad key".into()).status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bad_target_is_400() {
        assert_eq!(Error::BadTarget("private ip".into()).status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_response_serializes_code() {
        let resp = ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", "missing");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"code\":\"NOT_FOUND\""));
    }
}
