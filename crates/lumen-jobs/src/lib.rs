//! # lumen-jobs
//!
//! Enrichment scheduling and embedding deduplication for lumen.
//!
//! This crate provides:
//! - [`TaskStateTracker`]: tri-state per-kind flags with smart queue rules
//! - [`QueueDispatcher`]: exclusive batch claims, completion, retries, leases
//!   and the persisted worker lifecycle
//! - [`DedupCache`]: fingerprints, representative election, embedding
//!   propagation, orphan repair and the embedding cache
//! - [`Catalog`]: chunked registration and repairing deletes
//! - [`EnrichmentWorker`]: a polling harness around host-supplied handlers
//!
//! ## Example
//!
//! ```ignore
//! use lumen_db::{Database, Repositories};
//! use lumen_jobs::{EnrichmentKind, NoOpHandler, QueueDispatcher, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//! let repos = Repositories::from(&db);
//! let dispatcher = QueueDispatcher::from_repositories(&repos);
//! dispatcher.start(EnrichmentKind::Tagging).await?;
//!
//! let worker = WorkerBuilder::new(dispatcher)
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(NoOpHandler::new(EnrichmentKind::Tagging))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod catalog;
pub mod dedup;
pub mod dispatcher;
pub mod handler;
pub mod tracker;
pub mod worker;

// Re-export core types
pub use lumen_core::*;

pub use catalog::{Catalog, RegisterReport};
pub use dedup::DedupCache;
pub use dispatcher::QueueDispatcher;
pub use handler::{EnrichmentHandler, ItemContext, ItemResult, NoOpHandler};
pub use tracker::TaskStateTracker;
pub use worker::{
    parse_kinds, EnrichmentWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle,
};
