//! Core traits for lumen abstractions.
//!
//! These are the contracts any backing store must satisfy. `lumen-db` ships a
//! PostgreSQL implementation and an in-memory one; the services in
//! `lumen-jobs` and `lumen-search` only ever see these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::task_state::{EnrichmentKind, TaskState};

// =============================================================================
// CATALOG
// =============================================================================

/// Image and folder rows owned by the surrounding catalog.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Register a single image. All task states start as `NeverQueued`.
    async fn insert(&self, image: NewImage) -> Result<Uuid>;

    /// Register many images in one statement/transaction.
    async fn insert_batch(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>>;

    /// Get an image by id.
    async fn get(&self, id: Uuid) -> Result<Option<Image>>;

    /// Replace generation parameters; clears the stored fingerprint.
    async fn update_generation_params(&self, id: Uuid, params: GenerationParams) -> Result<()>;

    /// Store freshly computed vectors. `None` leaves a vector unchanged.
    async fn set_embeddings(
        &self,
        id: Uuid,
        text: Option<Vector>,
        visual: Option<Vector>,
    ) -> Result<()>;

    /// Delete images. Images borrowing embeddings from a deleted
    /// representative are repaired in the same transaction.
    async fn delete_images(&self, ids: &[Uuid]) -> Result<RepairReport>;

    /// Create a folder below `parent_id` (or at the root).
    async fn create_folder(&self, parent_id: Option<Uuid>, path: &str) -> Result<Uuid>;

    /// Ids of images in a folder, optionally including every descendant folder.
    async fn folder_image_ids(&self, folder_id: Uuid, recursive: bool) -> Result<Vec<Uuid>>;

    /// Delete a folder, its descendants and their images, repairing orphans.
    async fn delete_folder(&self, folder_id: Uuid) -> Result<RepairReport>;
}

// =============================================================================
// TASK STATE
// =============================================================================

/// Per-image, per-kind tri-state flags.
#[async_trait]
pub trait TaskStateRepository: Send + Sync {
    /// Unconditionally overwrite the flag of every id. Returns rows changed.
    async fn set_state(&self, kind: EnrichmentKind, ids: &[Uuid], state: TaskState)
        -> Result<u64>;

    /// Apply the smart queue rules. Returns the number of flags moved to `Pending`.
    async fn smart_queue(
        &self,
        kind: EnrichmentKind,
        ids: &[Uuid],
        skip_already_processed: bool,
    ) -> Result<u64>;

    /// Reset every `Pending` flag of `kind` to `NeverQueued` and drop the
    /// kind's unclaimed queue rows.
    async fn clear_pending(&self, kind: EnrichmentKind) -> Result<u64>;

    /// Insert queue rows for `Pending` images that have no active row.
    ///
    /// Images whose row for `kind` is permanently failed are skipped, so the
    /// retry bound holds across repeated calls.
    async fn enqueue_flagged(
        &self,
        kind: EnrichmentKind,
        priority: i32,
        queued_by: &str,
        limit: i64,
    ) -> Result<u64>;

    /// Flag distribution for one kind.
    async fn counts(&self, kind: EnrichmentKind) -> Result<TaskStateCounts>;
}

// =============================================================================
// QUEUE
// =============================================================================

/// Persistent multi-kind work queue.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Queue explicit images. Images with an active row are skipped.
    async fn enqueue(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        priority: i32,
        queued_by: &str,
    ) -> Result<u64>;

    /// Atomically claim up to `request.size` pending items.
    ///
    /// Concurrent callers never receive the same item.
    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<QueueItem>>;

    /// Mark a processing item completed and the image's flag `Completed`.
    async fn complete(&self, item_id: Uuid) -> Result<CompletionOutcome>;

    /// Mark a processing item failed and bump its retry count.
    async fn fail(&self, item_id: Uuid, message: &str) -> Result<QueueItem>;

    /// Send failed items below their retry bound back to pending.
    async fn retry_failed(&self, kind: Option<EnrichmentKind>) -> Result<u64>;

    /// Remove completed and failed rows.
    async fn clear_completed(&self, kind: Option<EnrichmentKind>) -> Result<u64>;

    /// Remove every row regardless of status.
    async fn clear_all(&self, kind: Option<EnrichmentKind>) -> Result<u64>;

    /// Return processing items with an expired lease to pending (or failed
    /// once their retry bound is reached).
    async fn release_expired_leases(&self) -> Result<u64>;

    /// Get an item by id.
    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>>;

    /// List items, newest first.
    async fn list(
        &self,
        kind: Option<EnrichmentKind>,
        status: Option<QueueItemStatus>,
        limit: i64,
    ) -> Result<Vec<QueueItem>>;

    /// Counters for one kind.
    async fn stats(&self, kind: EnrichmentKind) -> Result<QueueStats>;
}

/// Singleton worker lifecycle record per kind.
///
/// Every method touches only the fields it owns so concurrent writers never
/// lose each other's updates.
#[async_trait]
pub trait WorkerStateRepository: Send + Sync {
    /// Read the record, creating it on first use.
    async fn get(&self, kind: EnrichmentKind) -> Result<WorkerState>;

    /// Set the status and stamp the matching transition timestamp.
    async fn set_status(&self, kind: EnrichmentKind, status: WorkerStatus)
        -> Result<WorkerState>;

    /// Add to the cumulative counters.
    async fn increment_counters(&self, kind: EnrichmentKind, processed: i64, failed: i64)
        -> Result<()>;

    /// Record the last error text and time.
    async fn record_error(&self, kind: EnrichmentKind, message: &str) -> Result<()>;

    /// Zero both counters.
    async fn reset_counters(&self, kind: EnrichmentKind) -> Result<()>;
}

// =============================================================================
// DEDUPLICATION
// =============================================================================

/// Fingerprint groups, representatives and propagated embeddings.
#[async_trait]
pub trait DedupRepository: Send + Sync {
    /// Images with generation data but no fingerprint yet.
    async fn images_missing_fingerprint(&self, limit: i64) -> Result<Vec<FingerprintSource>>;

    /// Store computed fingerprints.
    async fn set_fingerprints(&self, values: &[(Uuid, String)]) -> Result<u64>;

    /// Groups with at least two members, ordered by fingerprint, after `after`.
    async fn fingerprint_groups(
        &self,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FingerprintGroup>>;

    /// Make `representative` the flagged representative of its group.
    /// Returns true when any row changed.
    async fn mark_representative(&self, fingerprint: &str, representative: Uuid)
        -> Result<bool>;

    /// Flagged representatives ordered by id, after `after`.
    async fn representatives(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>>;

    /// Copy a flagged representative's vectors to its group members.
    async fn propagate_from(&self, representative: Uuid) -> Result<PropagationOutcome>;

    /// Clear every reference to the given representatives.
    async fn repair_orphans(&self, representatives: &[Uuid]) -> Result<RepairReport>;

    /// Images whose source is neither themselves nor a flagged representative.
    async fn dangling_references(&self) -> Result<Vec<Uuid>>;

    /// Distinct sources those dangling references point at, ordered by id.
    /// Deleted sources are included.
    async fn dangling_sources(&self) -> Result<Vec<Uuid>>;
}

/// Content-addressed, reference-counted embedding cache.
#[async_trait]
pub trait EmbeddingCacheRepository: Send + Sync {
    /// On a hit, copy the vector onto the image and link it.
    async fn lookup_and_link(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
    ) -> Result<CacheLookup>;

    /// Insert (or reuse) an entry for freshly computed content and link it.
    async fn store(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
        vector: Vector,
    ) -> Result<EmbeddingCacheEntry>;

    /// Drop all links held by an image. Returns links removed.
    async fn release(&self, image_id: Uuid) -> Result<u64>;

    /// Get an entry.
    async fn get(&self, kind: CacheContentKind, content_hash: &str)
        -> Result<Option<EmbeddingCacheEntry>>;

    /// Delete unreferenced entries last used before `older_than`.
    async fn prune_unreferenced(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// SIMILARITY
// =============================================================================

/// Vector-index access for duplicate detection.
#[async_trait]
pub trait SimilarityRepository: Send + Sync {
    /// Number of images with a visual embedding.
    async fn visual_corpus_size(&self) -> Result<i64>;

    /// Ids of images with a visual embedding, ordered, after `after`.
    async fn visual_image_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>>;

    /// Approximate nearest neighbours of each id with similarity >= threshold.
    async fn nearest_pairs(
        &self,
        image_ids: &[Uuid],
        neighbours: i64,
        threshold: f32,
        ef_search: u32,
    ) -> Result<Vec<SimilarPair>>;

    /// Dimensions of the given images.
    async fn dimensions(&self, ids: &[Uuid]) -> Result<Vec<ImageDims>>;

    /// Images carrying a seed and model, ordered by id, after `after`.
    async fn variant_candidates(&self, after: Option<Uuid>, limit: i64)
        -> Result<Vec<ImageDescriptor>>;

    /// Replace every persisted cluster with `clusters`.
    async fn materialize_clusters(&self, clusters: &[DuplicateCluster]) -> Result<u64>;

    /// Read persisted clusters.
    async fn materialized_clusters(&self) -> Result<Vec<DuplicateCluster>>;
}
