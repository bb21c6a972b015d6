//! Centralized default constants for lumen.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// EMBEDDING
// =============================================================================

/// Dimension of the textual-semantic embedding space.
pub const TEXT_EMBED_DIMENSION: usize = 768;

/// Dimension of the visual embedding space (CLIP ViT-B/32 sized).
pub const VISUAL_EMBED_DIMENSION: usize = 512;

// =============================================================================
// QUEUE
// =============================================================================

/// Default maximum retry count for failed queue items.
pub const QUEUE_MAX_RETRIES: i32 = 3;

/// Default number of items handed out per claim.
pub const QUEUE_BATCH_SIZE: i64 = 16;

/// Upper bound on a single claim. Larger requests are clamped.
pub const QUEUE_MAX_BATCH_SIZE: i64 = 1_000;

/// Default priority for items queued without an explicit one.
pub const QUEUE_DEFAULT_PRIORITY: i32 = 0;

/// Lease length granted with every claim, in seconds.
pub const QUEUE_LEASE_SECS: i64 = 600;

/// Provenance tag for items queued by the tracker's flag materialization.
pub const QUEUED_BY_SMART_QUEUE: &str = "smart_queue";

// =============================================================================
// WORKER
// =============================================================================

/// Poll interval of the worker harness when the queue is empty or paused.
pub const WORKER_POLL_INTERVAL_MS: u64 = 2_000;

/// Per-item handler timeout in seconds.
pub const WORKER_ITEM_TIMEOUT_SECS: u64 = 300;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// BULK OPERATIONS
// =============================================================================

/// Rows handled per unit of work in cancellable sweeps.
pub const SWEEP_PAGE_SIZE: i64 = 500;

/// Rows inserted per statement during bulk image registration.
pub const REGISTER_CHUNK_SIZE: usize = 200;

// =============================================================================
// SIMILARITY
// =============================================================================

/// Default cosine similarity threshold for duplicate candidates.
pub const SIMILARITY_THRESHOLD: f32 = 0.95;

/// Neighbours fetched per image from the ANN index.
pub const SIMILARITY_NEIGHBOURS: i64 = 10;

/// Characters of the normalized prompt used as a parameter-group key.
pub const PROMPT_PREFIX_CHARS: usize = 64;

/// Lower bound of the linear scale ratio treated as an upscale.
pub const UPSCALE_RATIO_MIN: f64 = 1.8;

/// Upper bound of the linear scale ratio treated as an upscale.
pub const UPSCALE_RATIO_MAX: f64 = 2.2;

// =============================================================================
// EMBEDDING CACHE
// =============================================================================

/// Unreferenced cache entries younger than this are kept (hours).
pub const CACHE_PRUNE_AFTER_HOURS: i64 = 24;
