use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing_subscriber::EnvFilter;

use gateway_core::dispatch::Renderer;
use gateway_core::middleware::{request_id_layer, request_id_propagation_layer, sensitive_headers_layer};
use gateway_core::store::{CoordinationStore, RedisStore, ServiceRecord};
use gateway_core::store_pool::create_pool;

use render_service::browser_driver::HttpBrowserDriver;
use render_service::browser_pool::BrowserPool;
use render_service::config::Config;
use render_service::{handlers, AppState};

fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(service = %config.service.name, node_id = %config.service.node_id, "tracing initialized");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config);

    tracing::info!(
        node_id = %config.service.node_id,
        capacity = config.pool.capacity,
        "starting render-service"
    );

    let pool_conn = create_pool(&config.store).await?;
    let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::new(pool_conn));

    let factory = Arc::new(|| Arc::new(HttpBrowserDriver::new()) as Arc<dyn render_service::browser_driver::BrowserDriver>);
    let pool = Arc::new(BrowserPool::new(
        config.pool.capacity,
        config.pool.restart_after_renders,
        config.pool.strip_scripts,
        factory,
    ));
    pool.warmup(config.pool.warmup_count).await;

    let record = ServiceRecord {
        id: config.service.node_id.clone(),
        address: config.service.address.clone(),
        port: config.service.port,
        capacity: pool.capacity(),
        status: "healthy".to_string(),
        metadata: serde_json::json!({ "active_tabs": 0 }),
    };

    store.init_tabs(&record.id, pool.capacity()).await?;
    store.register_service(&record, config.store.service_ttl()).await?;
    tracing::info!(rs_id = %record.id, capacity = record.capacity, "registered with coordination store");

    let heartbeat_store = store.clone();
    let heartbeat_id = record.id.clone();
    let heartbeat_interval = config.service.heartbeat_interval();
    let service_ttl = config.store.service_ttl();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = heartbeat_store.heartbeat(&heartbeat_id, service_ttl).await {
                tracing::warn!(error = %e, "heartbeat renewal failed");
            }
        }
    });

    let state = AppState { pool: pool.clone() as Arc<dyn Renderer> };

    let app = Router::new()
        .route("/render", post(handlers::render))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(request_id_layer())
        .layer(request_id_propagation_layer())
        .layer(sensitive_headers_layer())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(TimeoutLayer::with_status_code(
            http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.pool.default_render_timeout_secs + 5),
        ));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.service.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // Shutdown ordering per §9: the listener is already drained by the
    // graceful-shutdown future above; release this node's registration
    // only after that completes so in-flight renders finish first.
    heartbeat_handle.abort();
    if let Err(e) = store.deregister_service(&record.id).await {
        tracing::warn!(error = %e, "failed to deregister from coordination store");
    }
    tracing::info!("render-service shutdown complete");

    Ok(())
}

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
}
