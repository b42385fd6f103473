//! Coordination-store (Redis) connection pool management.

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::{config::StoreConfig, error::Result};

/// Create a coordination-store connection pool with retry logic.
pub async fn create_pool(config: &StoreConfig) -> Result<Pool> {
    create_pool_with_retries(config, config.max_retries).await
}

async fn create_pool_with_retries(config: &StoreConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!("store connection established after {} attempt(s)", attempt + 1);
                } else {
                    tracing::info!(pool_size = config.pool_size, "store connection pool created");
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!("failed to connect to store after {} attempts: {}", max_retries + 1, e);
                    return Err(e);
                }
                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;
                tracing::warn!("store connection attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &StoreConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| crate::error::Error::Store(format!("failed to build pool: {e}")))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| crate::error::Error::Store(format!("failed to create pool: {e}")))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| crate::error::Error::Store(format!("failed to get connection: {e}")))?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_defaults_are_sane() {
        let config = StoreConfig::default();
        assert!(config.pool_size > 0);
        assert!(config.max_retries > 0);
    }
}
