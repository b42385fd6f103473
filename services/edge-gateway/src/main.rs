use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use edge_gateway::{handlers, AppState};
use gateway_core::bypass::{BypassConfig, BypassProxy};
use gateway_core::cache_manager::CacheManager;
use gateway_core::compression::Codec;
use gateway_core::config::Config;
use gateway_core::dispatch::{RendererDispatcher, SelectPolicy};
use gateway_core::hosts::HostTable;
use gateway_core::observability::init_tracing;
use gateway_core::pipeline::{PipelineConfig, RequestPipeline};
use gateway_core::replication::{Peer, ReplicationCoordinator};
use gateway_core::server::Server;
use gateway_core::store::RedisStore;
use gateway_core::store_pool::create_pool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config)?;

    tracing::info!(node_id = %config.service.node_id, port = config.service.port, "starting edge-gateway");

    let hosts = Arc::new(HostTable::load_from_dir(&config.hosts_path)?);

    let pool = create_pool(&config.store).await?;
    let store: Arc<dyn gateway_core::store::CoordinationStore> = Arc::new(RedisStore::new(pool));

    let codec = Codec::parse(&config.storage.codec)?;
    let cache = Arc::new(CacheManager::new(
        store.clone(),
        config.storage.base_dir.clone(),
        config.storage.compression_threshold_bytes,
        codec,
        config.storage.stale_ttl(),
        config.storage.serve_stale,
    ));

    let http = reqwest::Client::new();

    let bypass = Arc::new(BypassProxy::new(
        http.clone(),
        BypassConfig {
            reject_private_ips: config.bypass.reject_private_ips,
            timeout: config.bypass.timeout(),
        },
    ));

    let peers: Vec<Peer> = config
        .sharding
        .peers
        .iter()
        .map(|base_url| Peer { id: base_url.clone(), base_url: base_url.clone() })
        .collect();
    let replication = Arc::new(ReplicationCoordinator::new(
        store.clone(),
        http.clone(),
        config.service.node_id.clone(),
        config.sharding.replication_factor,
        peers,
    ));

    let renderer = Arc::new(RendererDispatcher::new(
        store.clone(),
        http.clone(),
        config.service.node_id.clone(),
        SelectPolicy::parse(&config.render.select_policy),
    ));

    let pipeline_config = PipelineConfig {
        node_id: config.service.node_id.clone(),
        lock_ttl: config.store.lock_ttl(),
        default_cache_ttl: config.render.default_cache_ttl(),
        render_timeout_secs: config.render.render_timeout_secs,
        strip_scripts: config.render.strip_scripts,
        bypass_on_failure: config.render.bypass_on_failure,
        touch_on_hit: config.render.touch_on_hit,
        lock_wait_attempts: config.render.lock_wait_attempts,
        lock_wait_interval: config.render.lock_wait_interval(),
    };

    let pipeline = Arc::new(RequestPipeline::new(
        hosts.clone(),
        cache.clone(),
        renderer,
        bypass,
        replication.clone(),
        store.clone(),
        pipeline_config,
    ));

    let state = AppState {
        pipeline,
        hosts,
        cache,
        replication,
        store,
        node_id: config.service.node_id.clone(),
        internal_auth_key: config.service.internal_auth_key.clone(),
    };

    let app = Router::new()
        .route("/render", get(handlers::render))
        .route("/debug/har/render", get(handlers::debug_har_render))
        .route("/internal/replicate/{cache_key}", post(handlers::push_replica).get(handlers::pull_replica))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::readiness))
        .with_state(state);

    let server = Server::new(config);
    server.serve(app).await?;

    tracing::info!("edge-gateway shutdown complete");
    Ok(())
}
