//! Service-level configuration, loaded with Figment.
//!
//! Precedence (highest to lowest): environment variables (`EDGECOMET_` prefix)
//! > `./config.toml` > built-in defaults. This covers process-boundary
//! settings only -- ports, store URL, storage roots, timeouts. The host/
//! dimension/rule table is a separate document, see [`crate::hosts`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    /// Path to the host/dimension/rule table (YAML, see `hosts.rs`).
    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            store: StoreConfig::default(),
            storage: StorageConfig::default(),
            sharding: ShardingConfig::default(),
            render: RenderConfig::default(),
            bypass: BypassConfig::default(),
            hosts_path: default_hosts_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// This node's identity in `eg_ids` / sharding peer lists.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
    /// Shared secret required in `X-Internal-Auth` for `/debug/har/render`.
    #[serde(default)]
    pub internal_auth_key: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            node_id: default_node_id(),
            port: default_port(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
            body_limit_mb: default_body_limit_mb(),
            cors_mode: default_cors_mode(),
            internal_auth_key: None,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Coordination store (Redis) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_store_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_service_ttl_secs")]
    pub service_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            pool_size: default_store_pool_size(),
            connection_timeout_secs: default_connection_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            service_ttl_secs: default_service_ttl_secs(),
        }
    }
}

impl StoreConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs(self.service_ttl_secs)
    }
}

/// On-disk artifact layout (§6): `{base}/{host_id}/{dim_id}/{h0}/{h1}/{fp}.{ext}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_base")]
    pub base_dir: PathBuf,
    /// Artifacts at or above this size (bytes) are compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub serve_stale: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_storage_base(),
            compression_threshold_bytes: default_compression_threshold(),
            codec: default_codec(),
            stale_ttl_secs: default_stale_ttl_secs(),
            serve_stale: true,
        }
    }
}

impl StorageConfig {
    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }
}

/// Replication/sharding coordinator settings (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_peers")]
    pub peers: Vec<String>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self { replication_factor: default_replication_factor(), peers: default_peers() }
    }
}

/// Renderer dispatcher settings (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_select_policy")]
    pub select_policy: String,
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub strip_scripts: bool,
    #[serde(default = "default_true")]
    pub bypass_on_failure: bool,
    /// TTL applied to a freshly rendered/bypassed entry when the matched
    /// rule carries no `cache_ttl_secs` override (§4.2, §4.5).
    #[serde(default = "default_cache_ttl_secs")]
    pub default_cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub touch_on_hit: bool,
    #[serde(default = "default_lock_wait_attempts")]
    pub lock_wait_attempts: u32,
    #[serde(default = "default_lock_wait_interval_ms")]
    pub lock_wait_interval_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            select_policy: default_select_policy(),
            render_timeout_secs: default_render_timeout_secs(),
            strip_scripts: true,
            bypass_on_failure: true,
            default_cache_ttl_secs: default_cache_ttl_secs(),
            touch_on_hit: true,
            lock_wait_attempts: default_lock_wait_attempts(),
            lock_wait_interval_ms: default_lock_wait_interval_ms(),
        }
    }
}

impl RenderConfig {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl_secs)
    }
    pub fn lock_wait_interval(&self) -> Duration {
        Duration::from_millis(self.lock_wait_interval_ms)
    }
}

/// Bypass proxy settings (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    #[serde(default = "default_true")]
    pub reject_private_ips: bool,
    #[serde(default = "default_bypass_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self { reject_private_ips: true, timeout_secs: default_bypass_timeout_secs() }
    }
}

impl BypassConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_service_name() -> String {
    "edge-gateway".to_string()
}
fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "restrictive".to_string()
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_pool_size() -> usize {
    16
}
fn default_connection_timeout_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_secs() -> u64 {
    1
}
fn default_lock_ttl_secs() -> u64 {
    60
}
fn default_service_ttl_secs() -> u64 {
    30
}
fn default_storage_base() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_codec() -> String {
    "snappy".to_string()
}
fn default_stale_ttl_secs() -> u64 {
    300
}
fn default_replication_factor() -> usize {
    2
}
fn default_peers() -> Vec<String> {
    Vec::new()
}
fn default_select_policy() -> String {
    "least_loaded".to_string()
}
fn default_render_timeout_secs() -> u64 {
    20
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_lock_wait_attempts() -> u32 {
    20
}
fn default_lock_wait_interval_ms() -> u64 {
    100
}
fn default_bypass_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_hosts_path() -> PathBuf {
    PathBuf::from("./hosts.yaml")
}

impl Config {
    /// Load configuration from `./config.toml`, overridden by `EDGECOMET_*` env vars.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if path.exists() {
            tracing::info!(path = %path.display(), "loading service configuration");
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("EDGECOMET_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.sharding.replication_factor, 2);
        assert!(config.storage.serve_stale);
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/config.toml").unwrap();
        assert_eq!(config.service.name, "edge-gateway");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("EDGECOMET_SERVICE__PORT", "9999");
        let config = Config::load_from("/nonexistent/config.toml").unwrap();
        std::env::remove_var("EDGECOMET_SERVICE__PORT");
        assert_eq!(config.service.port, 9999);
    }
}
