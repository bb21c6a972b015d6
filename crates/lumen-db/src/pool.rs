//! PostgreSQL connection pool for the lumen stores.
//!
//! A claimer holds one connection for the length of its claim transaction,
//! so `max_connections` also caps how many workers can claim at the same
//! time. Sizing is read from `DB_MAX_CONNECTIONS` and
//! `DB_ACQUIRE_TIMEOUT_SECS`; command-line flags override both.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use lumen_core::{Error, Result};

/// Connections opened when nothing else is configured.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How long a caller waits for a free connection before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sizing of the store's connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Read `DB_MAX_CONNECTIONS` and `DB_ACQUIRE_TIMEOUT_SECS`. Missing,
    /// unparsable or zero values keep the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = positive::<u32>(lookup("DB_MAX_CONNECTIONS")) {
            config.max_connections = n;
        }
        if let Some(secs) = positive::<u64>(lookup("DB_ACQUIRE_TIMEOUT_SECS")) {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// At least one connection is always kept.
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

fn positive<T: std::str::FromStr + PartialOrd + Default>(value: Option<String>) -> Option<T> {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|n| *n > T::default())
}

/// Open a pool against `database_url`.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Connected to database"
    );
    Ok(pool)
}

/// Point-in-time pool usage, reported by `lumen stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

impl PoolUsage {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle(),
            max_connections: pool.options().get_max_connections(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.size
            .saturating_sub(u32::try_from(self.idle).unwrap_or(u32::MAX))
    }

    /// Every connection is open and busy; the next claim has to wait.
    pub fn is_saturated(&self) -> bool {
        self.size >= self.max_connections && self.idle == 0
    }
}

/// Snapshot and log the pool's usage; warns when it is saturated.
pub fn log_pool_usage(pool: &PgPool) -> PoolUsage {
    let usage = PoolUsage::of(pool);
    debug!(
        subsystem = "database",
        component = "pool",
        op = "usage",
        pool_size = usage.size,
        pool_idle = usage.idle,
        in_use = usage.in_use(),
        "Pool usage"
    );
    if usage.is_saturated() {
        warn!(
            subsystem = "database",
            component = "pool",
            max_connections = usage.max_connections,
            "Connection pool saturated; raise DB_MAX_CONNECTIONS or run fewer claimers"
        );
    }
    usage
}
