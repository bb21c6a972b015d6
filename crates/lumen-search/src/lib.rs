//! # lumen-search
//!
//! Near-duplicate detection for lumen.
//!
//! This crate provides:
//! - Candidate generation through the HNSW index with corpus-tuned `ef_search`
//! - Transitive clustering over an arena-indexed union-find
//! - Filename-suffix and parameter-group draft/final heuristics
//! - Cluster materialization
//!
//! ## Example
//!
//! ```ignore
//! use lumen_search::{ClusterConfig, SimilarityClusterer};
//! use lumen_db::Database;
//! use tokio_util::sync::CancellationToken;
//!
//! let db = Database::connect("postgres://...").await?;
//! let clusterer = SimilarityClusterer::new(
//!     db.repositories().similarity,
//!     ClusterConfig::new().with_threshold(0.97),
//! )?;
//!
//! let cancel = CancellationToken::new();
//! let clusters = clusterer.find_clusters(&cancel).await?;
//! clusterer.materialize(&clusters).await?;
//! ```

pub mod clusterer;
pub mod clustering;
pub mod heuristics;
pub mod hnsw_tuning;
pub mod union_find;

// Re-export core types
pub use lumen_core::*;

pub use clusterer::{ClusterConfig, SimilarityClusterer};
pub use clustering::{cluster_pairs, preferred_of};
pub use heuristics::{
    normalize_prompt, scale_ratio, FilenamePatternDetector, ParameterGroupDetector,
    ParameterGrouping, DEFAULT_VARIANT_SUFFIXES,
};
pub use hnsw_tuning::{compute_ef, estimated_recall, HnswTuningConfig, RecallTarget};
pub use union_find::UnionFind;
