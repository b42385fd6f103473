//! Service-level configuration for the RS process, loaded with Figment
//! the same way `gateway_core::config` loads the EG's (§10).

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use gateway_core::config::StoreConfig;
use gateway_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self { service: ServiceConfig::default(), store: StoreConfig::default(), pool: PoolConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Address the dispatcher should reach this RS at; what gets written
    /// into its `ServiceRecord` (§3).
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            node_id: default_node_id(),
            address: default_address(),
            port: default_port(),
            log_level: default_log_level(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Browser-tab pool settings (§4.7, §5, §9). The actual driver behind each
/// tab is the out-of-scope collaborator; this governs only the pool shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_warmup_count")]
    pub warmup_count: usize,
    /// Recycle a tab's underlying driver after this many renders, bounding
    /// the blast radius of a leaky page (§9).
    #[serde(default = "default_restart_after_renders")]
    pub restart_after_renders: u64,
    #[serde(default = "default_render_timeout_secs")]
    pub default_render_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub strip_scripts: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            warmup_count: default_warmup_count(),
            restart_after_renders: default_restart_after_renders(),
            default_render_timeout_secs: default_render_timeout_secs(),
            strip_scripts: true,
        }
    }
}

impl PoolConfig {
    pub fn default_render_timeout(&self) -> Duration {
        Duration::from_secs(self.default_render_timeout_secs)
    }
}

fn default_service_name() -> String {
    "render-service".to_string()
}
fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_capacity() -> usize {
    8
}
fn default_warmup_count() -> usize {
    2
}
fn default_restart_after_renders() -> u64 {
    500
}
fn default_render_timeout_secs() -> u64 {
    20
}
fn default_true() -> bool {
    true
}

impl Config {
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
        assert_eq!(config.service.port, 9090);
        assert!(config.pool.capacity > 0);
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/config.toml").unwrap();
        assert_eq!(config.service.name, "render-service");
    }
}
