//! Connection pools for pipeline endpoints.
//!
//! The coordination store and each Postgres endpoint borrow a shared
//! [`PgPool`]; this module owns how those pools are sized and opened. Source
//! and target endpoints get separate pools so a slow apply side cannot
//! starve snapshot reads.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use shardpipe_core::{Error, Result};

/// Sizing and timeout settings for one endpoint's pool.
///
/// The defaults suit a migration workload: enough connections for a handful
/// of parallel work units plus the coordination store, with idle reaping so
/// a finished job does not pin connections on the endpoint.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a free connection before failing the acquire.
    pub acquire_timeout: Duration,
    /// Idle connections are reaped after this long.
    pub idle_timeout: Duration,
    /// Connections are recycled after this lifetime; `None` keeps them
    /// until the endpoint closes them.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl PoolConfig {
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }
}

/// Open a pool against `database_url` with default settings.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    connect_with(database_url, PoolConfig::default()).await
}

/// Open a pool against `database_url` with explicit settings.
pub async fn connect_with(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(max_lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;
    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        pool_size = pool.size(),
        "Opened endpoint connection pool"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder_overrides_defaults() {
        let config = PoolConfig::default()
            .max_connections(20)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(60))
            .max_lifetime(None);

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
        assert_eq!(config.max_lifetime, None);
        // Untouched fields keep their defaults.
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }
}
