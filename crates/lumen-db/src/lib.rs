//! # lumen-db
//!
//! Storage layer for lumen.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL + pgvector implementations of every `lumen-core` store trait
//! - An in-memory store implementing the same traits ([`memory::MemoryStore`])
//! - Schema migrations (feature `migrations`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use lumen_db::{Database, EnrichmentKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/lumen").await?;
//!     db.migrate().await?;
//!
//!     let stats = db.queue.stats(EnrichmentKind::Embedding).await?;
//!     println!("{} pending", stats.pending);
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

pub mod dedup;
pub mod embedding_cache;
pub mod images;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod similarity;
pub mod task_state;
pub mod worker_state;

// Test fixtures for integration tests.
// Always compiled so tests/ can use DEFAULT_TEST_DATABASE_URL.
pub mod test_fixtures;

// Re-export core types
pub use lumen_core::*;

pub use dedup::PgDedupRepository;
pub use embedding_cache::PgEmbeddingCacheRepository;
pub use images::PgImageRepository;
pub use memory::MemoryStore;
pub use pool::{connect_pool, log_pool_usage, PoolConfig, PoolUsage};
pub use queue::{PgQueueRepository, LEASE_EXPIRED_MESSAGE};
pub use similarity::{dedupe_pairs, PgSimilarityRepository};
pub use task_state::PgTaskStateRepository;
pub use worker_state::PgWorkerStateRepository;

/// Combined database context with all PostgreSQL repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Images and folders.
    pub images: PgImageRepository,
    /// Per-kind tri-state flags.
    pub task_states: PgTaskStateRepository,
    /// Work queue.
    pub queue: PgQueueRepository,
    /// Worker lifecycle records.
    pub workers: PgWorkerStateRepository,
    /// Fingerprints, representatives and propagation.
    pub dedup: PgDedupRepository,
    /// Content-addressed embedding cache.
    pub cache: PgEmbeddingCacheRepository,
    /// Vector index access for duplicate detection.
    pub similarity: PgSimilarityRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            images: PgImageRepository::new(pool.clone()),
            task_states: PgTaskStateRepository::new(pool.clone()),
            queue: PgQueueRepository::new(pool.clone()),
            workers: PgWorkerStateRepository::new(pool.clone()),
            dedup: PgDedupRepository::new(pool.clone()),
            cache: PgEmbeddingCacheRepository::new(pool.clone()),
            similarity: PgSimilarityRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with pool sizing read from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, &PoolConfig::from_env()).await
    }

    /// Connect with explicit pool sizing.
    pub async fn connect_with_config(url: &str, config: &PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Trait-object handles onto this database for the service crates.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            images: Arc::new(PgImageRepository::new(self.pool.clone())),
            task_states: Arc::new(PgTaskStateRepository::new(self.pool.clone())),
            queue: Arc::new(PgQueueRepository::new(self.pool.clone())),
            workers: Arc::new(PgWorkerStateRepository::new(self.pool.clone())),
            dedup: Arc::new(PgDedupRepository::new(self.pool.clone())),
            cache: Arc::new(PgEmbeddingCacheRepository::new(self.pool.clone())),
            similarity: Arc::new(PgSimilarityRepository::new(self.pool.clone())),
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

/// Shared handles onto one backing store, as consumed by the services.
#[derive(Clone)]
pub struct Repositories {
    pub images: Arc<dyn ImageRepository>,
    pub task_states: Arc<dyn TaskStateRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub workers: Arc<dyn WorkerStateRepository>,
    pub dedup: Arc<dyn DedupRepository>,
    pub cache: Arc<dyn EmbeddingCacheRepository>,
    pub similarity: Arc<dyn SimilarityRepository>,
}

impl Repositories {
    /// Every handle backed by the same in-memory store.
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            images: store.clone(),
            task_states: store.clone(),
            queue: store.clone(),
            workers: store.clone(),
            dedup: store.clone(),
            cache: store.clone(),
            similarity: store,
        }
    }
}

impl From<&Database> for Repositories {
    fn from(db: &Database) -> Self {
        db.repositories()
    }
}
