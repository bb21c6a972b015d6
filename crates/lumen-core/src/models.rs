//! Core data models for lumen.
//!
//! These types are shared across all lumen crates and represent the catalog
//! entities the scheduler, cache and clusterer operate on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::task_state::{EnrichmentKind, TaskStates};

pub use pgvector::Vector;

// =============================================================================
// IMAGE TYPES
// =============================================================================

/// Parameters the image was generated with. Every field is optional because
/// scanners only recover what the file's metadata exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub seed: Option<i64>,
    pub steps: Option<i32>,
    pub sampler: Option<String>,
    pub cfg_scale: Option<f32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

impl GenerationParams {
    /// True when the image carries enough generator metadata to fingerprint.
    ///
    /// Must stay in sync with the `prompt/model/seed IS NOT NULL` filter used
    /// by the store when paging unfingerprinted images.
    pub fn has_generation_data(&self) -> bool {
        self.prompt.is_some() || self.model.is_some() || self.seed.is_some()
    }

    /// Pixel count when both dimensions are known.
    pub fn pixels(&self) -> Option<i64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(i64::from(w) * i64::from(h)),
            _ => None,
        }
    }
}

/// Request to register an image found by the scanner.
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub folder_id: Option<Uuid>,
    pub filename: String,
    pub file_size: i64,
    pub params: GenerationParams,
}

impl NewImage {
    pub fn new(filename: impl Into<String>, file_size: i64) -> Self {
        Self {
            filename: filename.into(),
            file_size,
            ..Default::default()
        }
    }

    pub fn in_folder(mut self, folder_id: Uuid) -> Self {
        self.folder_id = Some(folder_id);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// An image row as seen by the enrichment core.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: Uuid,
    pub folder_id: Option<Uuid>,
    pub filename: String,
    pub file_size: i64,
    pub params: GenerationParams,
    pub text_embedding: Option<Vector>,
    pub visual_embedding: Option<Vector>,
    pub metadata_fingerprint: Option<String>,
    /// The image whose embeddings this one borrows (itself for a representative).
    pub embedding_source_id: Option<Uuid>,
    pub is_embedding_representative: bool,
    pub states: TaskStates,
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// True when `embedding_source_id` points at another image.
    pub fn borrows_embeddings(&self) -> bool {
        matches!(self.embedding_source_id, Some(src) if src != self.id)
    }
}

/// Minimal image projection used by heuristic detectors.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub id: Uuid,
    pub filename: String,
    pub file_size: i64,
    pub params: GenerationParams,
}

/// Image dimensions used to pick a preferred cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    pub id: Uuid,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

impl ImageDims {
    pub fn pixels(&self) -> i64 {
        match (self.width, self.height) {
            (Some(w), Some(h)) => i64::from(w) * i64::from(h),
            _ => 0,
        }
    }
}

/// A folder in the catalog hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// QUEUE TYPES
// =============================================================================

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }

    /// Pending and processing rows count against the per-(image, kind) limit.
    pub fn is_active(&self) -> bool {
        matches!(self, QueueItemStatus::Pending | QueueItemStatus::Processing)
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "completed" => Ok(QueueItemStatus::Completed),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// A unit of enrichment work for one image and one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub image_id: Uuid,
    pub kind: EnrichmentKind,
    pub priority: i32,
    pub status: QueueItemStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub queued_by: Option<String>,
    pub lease_owner: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// True when a failed item may still be sent back to pending.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Failed with the retry bound exhausted; surfaced to an operator.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == QueueItemStatus::Failed && !self.can_retry()
    }
}

/// Arguments of a batch claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub kind: EnrichmentKind,
    pub size: i64,
    /// Identifies the claiming worker in the lease columns.
    pub owner: String,
    pub lease: chrono::Duration,
}

impl ClaimRequest {
    pub fn new(kind: EnrichmentKind, size: i64, owner: impl Into<String>) -> Self {
        Self {
            kind,
            size,
            owner: owner.into(),
            lease: chrono::Duration::seconds(crate::defaults::QUEUE_LEASE_SECS),
        }
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Result of completing a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    /// The item was already completed; nothing changed.
    AlreadyCompleted,
}

/// Per-kind queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Failed items at or above their retry bound.
    pub permanently_failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Outcome of a bulk flag transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOutcome {
    pub requested: u64,
    pub transitioned: u64,
}

impl QueueOutcome {
    /// Ids left untouched because they were already queued or processed.
    pub fn skipped(&self) -> u64 {
        self.requested.saturating_sub(self.transitioned)
    }
}

/// Distribution of one kind's flags across the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateCounts {
    pub never_queued: i64,
    pub pending: i64,
    pub completed: i64,
}

// =============================================================================
// WORKER STATE
// =============================================================================

/// Lifecycle status of the worker serving one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Running => "running",
            WorkerStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(WorkerStatus::Stopped),
            "running" => Ok(WorkerStatus::Running),
            "paused" => Ok(WorkerStatus::Paused),
            other => Err(Error::InvalidInput(format!("unknown worker status: {other}"))),
        }
    }
}

/// Persisted singleton lifecycle record of one queue kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub kind: EnrichmentKind,
    pub status: WorkerStatus,
    pub processed_count: i64,
    pub failed_count: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerState {
    /// State of a kind whose worker has never been started.
    pub fn new(kind: EnrichmentKind) -> Self {
        Self {
            kind,
            status: WorkerStatus::Stopped,
            processed_count: 0,
            failed_count: 0,
            last_error: None,
            last_error_at: None,
            started_at: None,
            paused_at: None,
            stopped_at: None,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// EMBEDDING CACHE
// =============================================================================

/// What a cache entry's content hash was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheContentKind {
    /// Prompt or caption text; fills `text_embedding`.
    Text,
    /// Decoded pixel payload; fills `visual_embedding`.
    Pixels,
}

impl CacheContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheContentKind::Text => "text",
            CacheContentKind::Pixels => "pixels",
        }
    }
}

impl FromStr for CacheContentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(CacheContentKind::Text),
            "pixels" => Ok(CacheContentKind::Pixels),
            other => Err(Error::InvalidInput(format!("unknown content kind: {other}"))),
        }
    }
}

/// Content-addressed embedding shared by every image with the same content.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheEntry {
    pub content_hash: String,
    pub content_kind: CacheContentKind,
    pub vector: Vector,
    pub ref_count: i32,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of looking up content in the embedding cache.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Cached; the vector was copied onto the image and the link recorded.
    Hit(EmbeddingCacheEntry),
    /// Not cached; the caller must compute and `store` the embedding.
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

// =============================================================================
// DEDUPLICATION
// =============================================================================

/// Image fields needed to compute a fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintSource {
    pub id: Uuid,
    pub params: GenerationParams,
}

/// One member of a fingerprint group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMember {
    pub id: Uuid,
    pub file_size: i64,
}

/// Images sharing a strict fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintGroup {
    pub fingerprint: String,
    pub members: Vec<GroupMember>,
}

/// What a single representative's propagation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// The id is not (or no longer) a flagged representative.
    NotRepresentative,
    /// The representative has no vectors yet; nothing to copy.
    NoVectors,
    /// Members updated (zero when everything already pointed at it).
    Propagated(u64),
}

/// Summary of a propagation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub representatives_visited: u64,
    pub images_updated: u64,
    pub representatives_without_vectors: u64,
    pub cancelled: bool,
}

/// Images whose borrowed embeddings were cleared because their source went away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub representatives: Vec<Uuid>,
    pub affected_images: Vec<Uuid>,
}

impl RepairReport {
    pub fn merge(&mut self, other: RepairReport) {
        self.representatives.extend(other.representatives);
        self.affected_images.extend(other.affected_images);
    }
}

// =============================================================================
// SIMILARITY
// =============================================================================

/// Unordered pair of images above the similarity threshold, stored with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarPair {
    pub a: Uuid,
    pub b: Uuid,
    pub similarity: f32,
}

impl SimilarPair {
    /// Build a normalized pair; `None` for a self pair.
    pub fn new(x: Uuid, y: Uuid, similarity: f32) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self {
                a: x,
                b: y,
                similarity,
            }),
            std::cmp::Ordering::Greater => Some(Self {
                a: y,
                b: x,
                similarity,
            }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Transitively connected set of near-duplicate images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    /// Sorted member ids.
    pub members: Vec<Uuid>,
    pub preferred: Uuid,
    pub min_similarity: f32,
    pub max_similarity: f32,
}

/// Which heuristic produced a variant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSignal {
    FilenamePattern,
    ParameterGroup,
}

/// A likely draft/final pair of the same generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantPair {
    pub draft_id: Uuid,
    pub final_id: Uuid,
    pub signal: VariantSignal,
    /// Linear scale factor between the two, when both sizes are known.
    pub scale_ratio: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_round_trip() {
        for s in [
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            QueueItemStatus::Completed,
            QueueItemStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<QueueItemStatus>().unwrap(), s);
        }
        assert!(QueueItemStatus::Pending.is_active());
        assert!(!QueueItemStatus::Failed.is_active());
    }

    #[test]
    fn test_similar_pair_normalizes_order() {
        let lo = Uuid::from_u128(1);
        let hi = Uuid::from_u128(2);
        let pair = SimilarPair::new(hi, lo, 0.97).unwrap();
        assert_eq!(pair.a, lo);
        assert_eq!(pair.b, hi);
        assert!(SimilarPair::new(lo, lo, 1.0).is_none());
    }

    #[test]
    fn test_queue_outcome_skipped() {
        let outcome = QueueOutcome {
            requested: 10,
            transitioned: 5,
        };
        assert_eq!(outcome.skipped(), 5);
    }

    #[test]
    fn test_has_generation_data() {
        assert!(!GenerationParams::default().has_generation_data());
        let params = GenerationParams {
            seed: Some(42),
            ..Default::default()
        };
        assert!(params.has_generation_data());
        let dims_only = GenerationParams {
            width: Some(512),
            height: Some(512),
            ..Default::default()
        };
        assert!(!dims_only.has_generation_data());
        assert_eq!(dims_only.pixels(), Some(262_144));
    }

    #[test]
    fn test_queue_item_retry_bound() {
        let mut item = QueueItem {
            id: Uuid::new_v4(),
            image_id: Uuid::new_v4(),
            kind: EnrichmentKind::Tagging,
            priority: 0,
            status: QueueItemStatus::Failed,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: Some("boom".into()),
            retry_count: 2,
            max_retries: 3,
            queued_by: None,
            lease_owner: None,
            leased_until: None,
        };
        assert!(item.can_retry());
        item.retry_count = 3;
        assert!(item.is_permanently_failed());
    }

    #[test]
    fn test_worker_state_new_is_stopped() {
        let state = WorkerState::new(EnrichmentKind::Embedding);
        assert_eq!(state.status, WorkerStatus::Stopped);
        assert_eq!(state.processed_count, 0);
        assert!(state.started_at.is_none());
    }
}
