//! HTTP server with graceful shutdown.
//!
//! Shutdown ordering per the design notes: stop the listener (handled by
//! `axum::serve`'s graceful-shutdown future), drain in-flight requests, then
//! the caller is expected to release tab reservations/render locks and
//! deregister from the service registry before the process exits -- those
//! steps are orchestrated by the binary crate since they touch
//! service-specific state this crate doesn't own.

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::Result,
    middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer},
};

/// Server instance; wraps an axum `Router` with the ambient middleware stack
/// (tracing, compression, timeouts, body limits, panic recovery) and serves
/// it with graceful shutdown on SIGINT/SIGTERM.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self, app: Router) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("starting {} on {}", self.config.service.name, addr);
        self.log_middleware_config();

        let body_limit = self.config.service.body_limit_mb * 1024 * 1024;
        let cors_layer = self.build_cors_layer();

        let app = app
            .layer(cors_layer)
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                self.config.service.request_timeout(),
            ))
            .layer(RequestBodyLimitLayer::new(body_limit))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_response(DefaultOnResponse::new().include_headers(true)),
            )
            .layer(sensitive_headers_layer())
            .layer(request_id_propagation_layer())
            .layer(request_id_layer())
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("server shutdown complete");

        Ok(())
    }

    fn log_middleware_config(&self) {
        tracing::info!("middleware: panic recovery, request-id tracking, sensitive-header masking, compression enabled");
        tracing::info!("body limit: {} MB, cors mode: {}", self.config.service.body_limit_mb, self.config.service.cors_mode);
        tracing::info!("request timeout: {}s", self.config.service.request_timeout_secs);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn build_cors_layer(&self) -> CorsLayer {
        match self.config.service.cors_mode.as_str() {
            "permissive" => CorsLayer::permissive(),
            "restrictive" | "disabled" => CorsLayer::new(),
            other => {
                tracing::warn!("unknown cors mode {other}, defaulting to restrictive");
                CorsLayer::new()
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }

    tracing::info!("shutdown signal received, draining requests");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_creation_keeps_config() {
        let config = Config::default();
        let server = Server::new(config.clone());
        assert_eq!(server.config().service.port, config.service.port);
    }
}
