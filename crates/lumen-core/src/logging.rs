//! Structured logging schema and field name constants for lumen.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, item failed, retry bound reached |
//! | INFO  | Lifecycle events, sweep completions |
//! | DEBUG | Decision points, batch sizes, claim results |
//! | TRACE | Per-item iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "database", "catalog", "tracker", "queue", "jobs", "dedup",
/// "similarity", "search", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "dispatcher", "tracker", "worker", "clusterer"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim_batch", "smart_queue", "propagate"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Enrichment kind being operated on.
pub const KIND: &str = "kind";

/// Queue item UUID.
pub const ITEM_ID: &str = "item_id";

/// Image UUID.
pub const IMAGE_ID: &str = "image_id";

/// Folder UUID.
pub const FOLDER_ID: &str = "folder_id";

/// Worker lease owner identifier.
pub const OWNER: &str = "owner";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of rows requested by the caller.
pub const REQUESTED: &str = "requested";

/// Number of rows actually changed.
pub const AFFECTED: &str = "affected";

/// Number of clusters or groups produced.
pub const GROUP_COUNT: &str = "group_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Whether a sweep stopped early on its cancellation signal.
pub const CANCELLED: &str = "cancelled";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_are_snake_case() {
        for field in [
            SUBSYSTEM, COMPONENT, OPERATION, KIND, ITEM_ID, IMAGE_ID, FOLDER_ID, OWNER,
            DURATION_MS, REQUESTED, AFFECTED, GROUP_COUNT, ERROR_MSG, CANCELLED,
        ] {
            assert!(field
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
