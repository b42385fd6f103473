//! # gateway-core
//!
//! Shared building blocks for the EdgeComet rendering gateway: URL
//! normalization, rule matching, UA dimensioning, the coordination-store
//! client, the content-addressed cache manager, the replication/sharding
//! coordinator, and the renderer-dispatch and bypass-proxy primitives.
//!
//! The two binaries in this workspace -- `edge-gateway` (the EG) and
//! `render-service` (the RS) -- compose these into a running process;
//! this crate holds no `main`.

pub mod bot_alias;
pub mod bypass;
pub mod cache_manager;
pub mod compression;
pub mod config;
pub mod dimension;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod hosts;
pub mod ids;
pub mod middleware;
pub mod normalize;
pub mod observability;
pub mod pipeline;
pub mod replication;
pub mod rules;
pub mod server;
pub mod store;
pub mod store_pool;

/// Prelude module for convenient imports in the binary crates.
pub mod prelude {
    pub use crate::bot_alias::{resolve_alias, UnknownAliasError};
    pub use crate::bypass::{BypassConfig as BypassProxyConfig, BypassProxy, BypassResult};
    pub use crate::cache_manager::{CacheEntry, CacheManager, CacheOutcome, EntrySource};
    pub use crate::compression::Codec;
    pub use crate::config::Config;
    pub use crate::dimension::{resolve_dimension, DimensionResolution};
    pub use crate::dispatch::{
        RedirectCapture, RenderJob, RenderResult, Renderer, RendererDispatcher, SelectPolicy,
    };
    pub use crate::error::{Error, Result};
    pub use crate::fingerprint::{cache_key, fingerprint, shard_prefixes};
    pub use crate::hosts::{Dimension, Host, HostTable, Rule, UnmatchedDimensionPolicy};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::normalize::{normalize, NormalizedUrl};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{EmitHeaders, RenderAction, RequestPipeline};
    pub use crate::replication::ReplicationCoordinator;
    pub use crate::rules::{resolve_rule, MatchedRule};
    pub use crate::server::Server;
    pub use crate::store::CoordinationStore;

    pub use axum::{
        extract::{Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::get,
        Router,
    };
    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
