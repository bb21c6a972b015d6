//! Claim, complete and fail queue items; drive the per-kind worker record.
//!
//! The dispatcher keeps no lock of its own. Exclusive claims come from the
//! store (`SKIP LOCKED` on PostgreSQL, the store lock in memory) and every
//! worker-state read goes back to the store.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use lumen_core::defaults::{QUEUE_LEASE_SECS, QUEUE_MAX_BATCH_SIZE};
use lumen_core::{
    new_v7, ClaimRequest, CompletionOutcome, EnrichmentKind, Error, QueueItem, QueueItemStatus,
    QueueRepository, QueueStats, Result, WorkerState, WorkerStateRepository, WorkerStatus,
};
use lumen_db::Repositories;

/// Queue operations for any number of concurrent workers.
#[derive(Clone)]
pub struct QueueDispatcher {
    queue: Arc<dyn QueueRepository>,
    workers: Arc<dyn WorkerStateRepository>,
    owner: String,
    lease: chrono::Duration,
}

impl QueueDispatcher {
    /// Dispatcher with a unique lease owner and the default lease.
    pub fn new(queue: Arc<dyn QueueRepository>, workers: Arc<dyn WorkerStateRepository>) -> Self {
        Self {
            queue,
            workers,
            owner: format!("lumen-{}-{}", std::process::id(), new_v7().simple()),
            lease: chrono::Duration::seconds(QUEUE_LEASE_SECS),
        }
    }

    pub fn from_repositories(repos: &Repositories) -> Self {
        Self::new(repos.queue.clone(), repos.workers.clone())
    }

    /// Name written to `lease_owner` on claim.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    // ─── Queue ─────────────────────────────────────────────────────────────

    /// Queue explicit images; ones already queued or processing are skipped.
    pub async fn enqueue(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        priority: i32,
        queued_by: &str,
    ) -> Result<u64> {
        if image_ids.is_empty() {
            return Ok(0);
        }
        self.queue.enqueue(kind, image_ids, priority, queued_by).await
    }

    /// Claim up to `size` pending items of `kind` for this dispatcher's owner.
    ///
    /// Sizes above [`QUEUE_MAX_BATCH_SIZE`] are clamped.
    pub async fn claim_batch(&self, kind: EnrichmentKind, size: i64) -> Result<Vec<QueueItem>> {
        if size < 1 {
            return Err(Error::InvalidInput(format!(
                "claim size must be at least 1, got {size}"
            )));
        }
        let request = ClaimRequest::new(kind, size.min(QUEUE_MAX_BATCH_SIZE), self.owner.clone())
            .with_lease(self.lease);
        self.queue.claim_batch(&request).await
    }

    pub async fn complete(&self, item_id: Uuid) -> Result<CompletionOutcome> {
        let outcome = self.queue.complete(item_id).await?;
        if outcome == CompletionOutcome::AlreadyCompleted {
            debug!(
                subsystem = "jobs",
                component = "dispatcher",
                op = "complete",
                item_id = %item_id,
                "Item already completed"
            );
        }
        Ok(outcome)
    }

    pub async fn fail(&self, item_id: Uuid, message: &str) -> Result<QueueItem> {
        self.queue.fail(item_id, message).await
    }

    /// Send failed items under their retry bound back to pending.
    pub async fn retry_failed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let retried = self.queue.retry_failed(kind).await?;
        info!(
            subsystem = "jobs",
            component = "dispatcher",
            op = "retry_failed",
            kind = ?kind,
            affected = retried,
            "Requeued failed items"
        );
        Ok(retried)
    }

    /// Remove completed and failed rows.
    pub async fn clear_completed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        self.queue.clear_completed(kind).await
    }

    /// Remove every row. Destructive.
    pub async fn clear_all(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let removed = self.queue.clear_all(kind).await?;
        warn!(
            subsystem = "jobs",
            component = "dispatcher",
            op = "clear_all",
            kind = ?kind,
            affected = removed,
            "Cleared queue"
        );
        Ok(removed)
    }

    pub async fn release_expired_leases(&self) -> Result<u64> {
        self.queue.release_expired_leases().await
    }

    pub async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>> {
        self.queue.get(item_id).await
    }

    pub async fn list(
        &self,
        kind: Option<EnrichmentKind>,
        status: Option<QueueItemStatus>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        self.queue.list(kind, status, limit).await
    }

    pub async fn stats(&self, kind: EnrichmentKind) -> Result<QueueStats> {
        self.queue.stats(kind).await
    }

    // ─── Worker lifecycle ──────────────────────────────────────────────────

    pub async fn start(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        self.transition(kind, WorkerStatus::Running).await
    }

    pub async fn pause(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        self.transition(kind, WorkerStatus::Paused).await
    }

    pub async fn stop(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        self.transition(kind, WorkerStatus::Stopped).await
    }

    async fn transition(&self, kind: EnrichmentKind, status: WorkerStatus) -> Result<WorkerState> {
        let state = self.workers.set_status(kind, status).await?;
        info!(
            subsystem = "jobs",
            component = "dispatcher",
            op = "set_status",
            kind = %kind,
            status = %status,
            "Worker status changed"
        );
        Ok(state)
    }

    /// Current record, read from the store.
    pub async fn worker_state(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        self.workers.get(kind).await
    }

    pub async fn increment_counters(
        &self,
        kind: EnrichmentKind,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        self.workers.increment_counters(kind, processed, failed).await
    }

    pub async fn record_error(&self, kind: EnrichmentKind, message: &str) -> Result<()> {
        self.workers.record_error(kind, message).await
    }

    pub async fn reset_counters(&self, kind: EnrichmentKind) -> Result<()> {
        self.workers.reset_counters(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_db::MemoryStore;

    fn dispatcher() -> QueueDispatcher {
        QueueDispatcher::from_repositories(&Repositories::memory(MemoryStore::new()))
    }

    #[test]
    fn test_owner_is_unique_per_dispatcher() {
        let a = dispatcher();
        let b = dispatcher();
        assert_ne!(a.owner(), b.owner());
        assert_eq!(a.with_owner("w1").owner(), "w1");
    }

    #[tokio::test]
    async fn test_zero_claim_is_rejected() {
        let result = dispatcher().claim_batch(EnrichmentKind::Tagging, 0).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_empty_enqueue_is_noop() {
        let queued = dispatcher()
            .enqueue(EnrichmentKind::Tagging, &[], 0, "test")
            .await
            .unwrap();
        assert_eq!(queued, 0);
    }
}
