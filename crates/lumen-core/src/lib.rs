//! # lumen-core
//!
//! Core types, traits, and abstractions for lumen, the enrichment scheduler
//! and duplicate detector of an image catalog.
//!
//! This crate provides the data structures and store contracts that the other
//! lumen crates depend on.

pub mod defaults;
pub mod error;
pub mod fingerprint;
pub mod ids;
pub mod logging;
pub mod models;
pub mod task_state;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use fingerprint::{
    compute_content_hash, elect_representative, FingerprintPolicy, ResolutionAgnosticFingerprint,
    StrictFingerprint,
};
pub use ids::new_v7;
pub use models::*;
pub use task_state::{
    reopens_completed, smart_queue_transition, EnrichmentKind, TaskState, TaskStates,
};
pub use traits::*;
