//! The Edge Gateway process: the request pipeline's HTTP surface, the
//! EG-to-EG replication endpoints, and the diagnostic/debug routes (§4.9, §6).

pub mod handlers;

use std::sync::Arc;

use gateway_core::{
    cache_manager::CacheManager, hosts::HostTable, pipeline::RequestPipeline,
    replication::ReplicationCoordinator, store::CoordinationStore,
};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub hosts: Arc<HostTable>,
    pub cache: Arc<CacheManager>,
    pub replication: Arc<ReplicationCoordinator>,
    pub store: Arc<dyn CoordinationStore>,
    pub node_id: String,
    /// Shared secret required in `X-Internal-Auth` for `/debug/har/render`.
    pub internal_auth_key: Option<String>,
}
