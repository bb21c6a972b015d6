//! Per-image, per-kind processing flags.
//!
//! The tracker is the catalog-facing side of scheduling: scanners and
//! operators flag images, and [`TaskStateTracker::enqueue_flagged`] turns
//! `Pending` flags into queue rows for the dispatcher.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::{
    EnrichmentKind, ImageRepository, QueueOutcome, Result, TaskState, TaskStateCounts,
    TaskStateRepository,
};
use lumen_db::Repositories;

fn distinct(ids: &[Uuid]) -> Vec<Uuid> {
    ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Applies the tri-state flag rules for every enrichment kind.
#[derive(Clone)]
pub struct TaskStateTracker {
    states: Arc<dyn TaskStateRepository>,
    images: Arc<dyn ImageRepository>,
}

impl TaskStateTracker {
    pub fn new(states: Arc<dyn TaskStateRepository>, images: Arc<dyn ImageRepository>) -> Self {
        Self { states, images }
    }

    pub fn from_repositories(repos: &Repositories) -> Self {
        Self::new(repos.task_states.clone(), repos.images.clone())
    }

    /// Overwrite the flag of every id, bypassing the smart queue rules.
    ///
    /// This is the only way to reopen completed work of a write-once kind.
    pub async fn set_needs(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        state: TaskState,
    ) -> Result<u64> {
        let ids = distinct(image_ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let changed = self.states.set_state(kind, &ids, state).await?;
        info!(
            subsystem = "jobs",
            component = "tracker",
            op = "set_needs",
            kind = %kind,
            state = %state,
            requested = ids.len(),
            affected = changed,
            "Overwrote task states"
        );
        Ok(changed)
    }

    /// Flag images for processing under the smart queue rules.
    ///
    /// `NeverQueued` always becomes `Pending`. `Completed` becomes `Pending`
    /// only for reprocessable kinds and only when `skip_already_processed`
    /// is false. `Pending` is left alone.
    pub async fn smart_queue(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        skip_already_processed: bool,
    ) -> Result<QueueOutcome> {
        let ids = distinct(image_ids);
        let requested = ids.len() as u64;
        if ids.is_empty() {
            return Ok(QueueOutcome::default());
        }
        let transitioned = self
            .states
            .smart_queue(kind, &ids, skip_already_processed)
            .await?;
        let outcome = QueueOutcome {
            requested,
            transitioned,
        };
        info!(
            subsystem = "jobs",
            component = "tracker",
            op = "smart_queue",
            kind = %kind,
            skip_already_processed,
            requested,
            affected = transitioned,
            "{} of {} queued",
            transitioned,
            requested
        );
        Ok(outcome)
    }

    /// Return every `Pending` flag of `kind` to `NeverQueued`.
    pub async fn clear_queue(&self, kind: EnrichmentKind) -> Result<u64> {
        let cleared = self.states.clear_pending(kind).await?;
        info!(
            subsystem = "jobs",
            component = "tracker",
            op = "clear_queue",
            kind = %kind,
            affected = cleared,
            "Cleared pending flags"
        );
        Ok(cleared)
    }

    /// [`smart_queue`](Self::smart_queue) over a folder, optionally recursive.
    pub async fn smart_queue_folder(
        &self,
        kind: EnrichmentKind,
        folder_id: Uuid,
        recursive: bool,
        skip_already_processed: bool,
    ) -> Result<QueueOutcome> {
        let ids = self.images.folder_image_ids(folder_id, recursive).await?;
        debug!(
            subsystem = "jobs",
            component = "tracker",
            op = "smart_queue_folder",
            folder_id = %folder_id,
            recursive,
            requested = ids.len(),
            "Resolved folder images"
        );
        self.smart_queue(kind, &ids, skip_already_processed).await
    }

    /// [`set_needs`](Self::set_needs) over a folder, optionally recursive.
    pub async fn set_needs_folder(
        &self,
        kind: EnrichmentKind,
        folder_id: Uuid,
        recursive: bool,
        state: TaskState,
    ) -> Result<u64> {
        let ids = self.images.folder_image_ids(folder_id, recursive).await?;
        self.set_needs(kind, &ids, state).await
    }

    /// Create queue rows for up to `limit` flagged images without an active
    /// or permanently failed row.
    pub async fn enqueue_flagged(
        &self,
        kind: EnrichmentKind,
        priority: i32,
        queued_by: &str,
        limit: i64,
    ) -> Result<u64> {
        let inserted = self
            .states
            .enqueue_flagged(kind, priority, queued_by, limit)
            .await?;
        debug!(
            subsystem = "jobs",
            component = "tracker",
            op = "enqueue_flagged",
            kind = %kind,
            affected = inserted,
            "Materialized queue rows"
        );
        Ok(inserted)
    }

    pub async fn counts(&self, kind: EnrichmentKind) -> Result<TaskStateCounts> {
        self.states.counts(kind).await
    }
}
