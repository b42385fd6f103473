//! Structured logging initialization.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON-structured tracing for the process.
///
/// Every pipeline stage instruments its span with `request_id`, `host_id`,
/// and `fingerprint` fields; this just wires up the global subscriber that
/// renders them.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(service = %config.service.name, node_id = %config.service.node_id, "tracing initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic() {
        let config = Config::default();
        let _ = init_tracing(&config);
    }
}
