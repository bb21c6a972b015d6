//! Task-state and queue behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use lumen_db::{MemoryStore, Repositories};
use lumen_jobs::{
    CompletionOutcome, EnrichmentKind, Error, NewImage, QueueDispatcher, QueueItemStatus,
    TaskState, TaskStateTracker, WorkerStatus,
};

struct Fixture {
    repos: Repositories,
    tracker: TaskStateTracker,
    dispatcher: QueueDispatcher,
}

impl Fixture {
    fn new() -> Self {
        let repos = Repositories::memory(MemoryStore::new());
        Self {
            tracker: TaskStateTracker::from_repositories(&repos),
            dispatcher: QueueDispatcher::from_repositories(&repos),
            repos,
        }
    }

    async fn images(&self, n: usize) -> Vec<Uuid> {
        let batch = (0..n)
            .map(|i| NewImage::new(format!("img_{i:04}.png"), 1_000 + i as i64))
            .collect();
        self.repos.images.insert_batch(batch).await.unwrap()
    }

    async fn state(&self, id: Uuid, kind: EnrichmentKind) -> TaskState {
        self.repos
            .images
            .get(id)
            .await
            .unwrap()
            .unwrap()
            .states
            .get(kind)
    }
}

// ─── Tracker ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ten_image_scenario_reports_five() {
    let fx = Fixture::new();
    let ids = fx.images(10).await;
    let kind = EnrichmentKind::Embedding;
    fx.tracker
        .set_needs(kind, &ids[0..3], TaskState::Completed)
        .await
        .unwrap();
    fx.tracker
        .set_needs(kind, &ids[3..5], TaskState::Pending)
        .await
        .unwrap();

    let outcome = fx.tracker.smart_queue(kind, &ids, true).await.unwrap();

    assert_eq!(outcome.requested, 10);
    assert_eq!(outcome.transitioned, 5);
    assert_eq!(outcome.skipped(), 5);
    for id in &ids[0..3] {
        assert_eq!(fx.state(*id, kind).await, TaskState::Completed);
    }
    for id in &ids[3..] {
        assert_eq!(fx.state(*id, kind).await, TaskState::Pending);
    }
}

#[tokio::test]
async fn test_write_once_kinds_never_reopened_by_smart_queue() {
    let fx = Fixture::new();
    let ids = fx.images(4).await;
    for kind in [EnrichmentKind::Embedding, EnrichmentKind::FaceDetection] {
        fx.tracker
            .set_needs(kind, &ids, TaskState::Completed)
            .await
            .unwrap();
        for skip in [true, false] {
            let outcome = fx.tracker.smart_queue(kind, &ids, skip).await.unwrap();
            assert_eq!(outcome.transitioned, 0, "{kind} reopened with skip={skip}");
        }
        // Only an administrative overwrite reopens them
        assert_eq!(
            fx.tracker
                .set_needs(kind, &ids[..1], TaskState::Pending)
                .await
                .unwrap(),
            1
        );
        assert_eq!(fx.state(ids[0], kind).await, TaskState::Pending);
    }
}

#[tokio::test]
async fn test_reprocessable_kind_reopens_without_skip() {
    let fx = Fixture::new();
    let ids = fx.images(3).await;
    let kind = EnrichmentKind::Tagging;
    fx.tracker
        .set_needs(kind, &ids, TaskState::Completed)
        .await
        .unwrap();

    assert_eq!(
        fx.tracker.smart_queue(kind, &ids, true).await.unwrap().transitioned,
        0
    );
    assert_eq!(
        fx.tracker.smart_queue(kind, &ids, false).await.unwrap().transitioned,
        3
    );
}

#[tokio::test]
async fn test_clear_queue_returns_to_never_queued_and_drops_rows() {
    let fx = Fixture::new();
    let ids = fx.images(5).await;
    let kind = EnrichmentKind::Captioning;
    fx.tracker.smart_queue(kind, &ids, true).await.unwrap();
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 100).await.unwrap(), 5);
    // One item is already being worked on
    let claimed = fx.dispatcher.claim_batch(kind, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let cleared = fx.tracker.clear_queue(kind).await.unwrap();
    assert_eq!(cleared, 5);
    let counts = fx.tracker.counts(kind).await.unwrap();
    assert_eq!(counts.never_queued, 5);
    assert_eq!(counts.completed, 0);

    let stats = fx.dispatcher.stats(kind).await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 1);
}

#[tokio::test]
async fn test_enqueue_flagged_skips_active_rows() {
    let fx = Fixture::new();
    let ids = fx.images(6).await;
    let kind = EnrichmentKind::Tagging;
    fx.tracker.smart_queue(kind, &ids, true).await.unwrap();

    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 4).await.unwrap(), 4);
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 100).await.unwrap(), 2);
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 100).await.unwrap(), 0);
    assert_eq!(fx.dispatcher.stats(kind).await.unwrap().pending, 6);
}

#[tokio::test]
async fn test_folder_scoped_smart_queue_recurses() {
    let fx = Fixture::new();
    let root = fx.repos.images.create_folder(None, "/renders").await.unwrap();
    let child = fx
        .repos
        .images
        .create_folder(Some(root), "/renders/2026")
        .await
        .unwrap();
    let in_root = fx
        .repos
        .images
        .insert(NewImage::new("a.png", 1).in_folder(root))
        .await
        .unwrap();
    let in_child = fx
        .repos
        .images
        .insert(NewImage::new("b.png", 1).in_folder(child))
        .await
        .unwrap();
    let kind = EnrichmentKind::Tagging;

    let shallow = fx
        .tracker
        .smart_queue_folder(kind, root, false, true)
        .await
        .unwrap();
    assert_eq!(shallow.transitioned, 1);
    assert_eq!(fx.state(in_child, kind).await, TaskState::NeverQueued);

    let deep = fx
        .tracker
        .smart_queue_folder(kind, root, true, true)
        .await
        .unwrap();
    assert_eq!((deep.requested, deep.transitioned), (2, 1));
    assert_eq!(fx.state(in_root, kind).await, TaskState::Pending);
    assert_eq!(fx.state(in_child, kind).await, TaskState::Pending);

    let reset = fx
        .tracker
        .set_needs_folder(kind, root, true, TaskState::NeverQueued)
        .await
        .unwrap();
    assert_eq!(reset, 2);
}

#[tokio::test]
async fn test_unknown_folder_is_an_error() {
    let fx = Fixture::new();
    let result = fx
        .tracker
        .smart_queue_folder(EnrichmentKind::Tagging, Uuid::from_u128(9), true, true)
        .await;
    assert!(matches!(result, Err(Error::FolderNotFound(_))));
}

// ─── Dispatcher ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_overlap() {
    let fx = Fixture::new();
    let ids = fx.images(50).await;
    let kind = EnrichmentKind::Embedding;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..8 {
        let dispatcher = fx.dispatcher.clone().with_owner(format!("worker-{n}"));
        tasks.spawn(async move { dispatcher.claim_batch(kind, 10).await.unwrap() });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(batch) = tasks.join_next().await {
        for item in batch.unwrap() {
            assert_eq!(item.status, QueueItemStatus::Processing);
            assert!(item.leased_until.is_some());
            assert!(seen.insert(item.id), "item {} claimed twice", item.id);
            total += 1;
        }
    }
    // min(M = 50, 8 * 10 = 80)
    assert_eq!(total, 50);
    assert_eq!(seen.len(), 50);
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_age() {
    let fx = Fixture::new();
    let ids = fx.images(3).await;
    let kind = EnrichmentKind::Tagging;
    fx.dispatcher.enqueue(kind, &ids[0..1], 0, "test").await.unwrap();
    fx.dispatcher.enqueue(kind, &ids[1..2], 10, "test").await.unwrap();
    fx.dispatcher.enqueue(kind, &ids[2..3], 0, "test").await.unwrap();

    let claimed = fx.dispatcher.claim_batch(kind, 3).await.unwrap();
    let order: Vec<Uuid> = claimed.iter().map(|i| i.image_id).collect();
    assert_eq!(order, vec![ids[1], ids[0], ids[2]]);
}

#[tokio::test]
async fn test_complete_sets_flag_and_is_idempotent() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::Captioning;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();
    assert_eq!(fx.state(ids[0], kind).await, TaskState::Pending);

    let item = fx.dispatcher.claim_batch(kind, 1).await.unwrap().remove(0);
    assert_eq!(
        fx.dispatcher.complete(item.id).await.unwrap(),
        CompletionOutcome::Completed
    );
    assert_eq!(
        fx.dispatcher.complete(item.id).await.unwrap(),
        CompletionOutcome::AlreadyCompleted
    );
    assert_eq!(fx.state(ids[0], kind).await, TaskState::Completed);
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::Tagging;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();
    let pending = fx
        .dispatcher
        .list(Some(kind), Some(QueueItemStatus::Pending), 10)
        .await
        .unwrap()
        .remove(0);

    assert!(matches!(
        fx.dispatcher.complete(pending.id).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        fx.dispatcher.fail(pending.id, "boom").await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        fx.dispatcher.complete(Uuid::from_u128(1)).await,
        Err(Error::QueueItemNotFound(_))
    ));
}

#[tokio::test]
async fn test_retry_bound_is_respected() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::FaceDetection;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();

    // Default bound is three attempts
    for attempt in 1..=3 {
        let item = fx.dispatcher.claim_batch(kind, 1).await.unwrap().remove(0);
        let failed = fx.dispatcher.fail(item.id, "model crashed").await.unwrap();
        assert_eq!(failed.retry_count, attempt);
        assert_eq!(failed.error_message.as_deref(), Some("model crashed"));

        let retried = fx.dispatcher.retry_failed(Some(kind)).await.unwrap();
        if attempt < 3 {
            assert_eq!(retried, 1);
            let item = fx.dispatcher.get(item.id).await.unwrap().unwrap();
            assert_eq!(item.status, QueueItemStatus::Pending);
            assert!(item.error_message.is_none());
            assert!(item.started_at.is_none());
            assert!(item.completed_at.is_none());
        } else {
            assert_eq!(retried, 0);
        }
    }

    let stats = fx.dispatcher.stats(kind).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.permanently_failed, 1);
    assert!(fx.dispatcher.claim_batch(kind, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_not_requeued_from_flags() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::Tagging;
    fx.tracker.smart_queue(kind, &ids, true).await.unwrap();
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 1);

    for _ in 0..3 {
        let item = fx.dispatcher.claim_batch(kind, 1).await.unwrap().remove(0);
        fx.dispatcher.fail(item.id, "tagger unavailable").await.unwrap();
        fx.dispatcher.retry_failed(Some(kind)).await.unwrap();
    }
    let before = fx.dispatcher.stats(kind).await.unwrap();
    assert_eq!(before.permanently_failed, 1);
    // The flag stays pending; only the row records the failure
    assert_eq!(fx.state(ids[0], kind).await, TaskState::Pending);

    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 0);
    assert_eq!(fx.tracker.smart_queue(kind, &ids, false).await.unwrap().transitioned, 0);
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 0);

    let after = fx.dispatcher.stats(kind).await.unwrap();
    assert_eq!(after.pending, 0);
    assert_eq!(after.permanently_failed, before.permanently_failed);
    assert!(fx.dispatcher.claim_batch(kind, 1).await.unwrap().is_empty());

    // Clearing the failed row is the operator's way back in
    assert_eq!(fx.dispatcher.clear_all(Some(kind)).await.unwrap(), 1);
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 1);
}

#[tokio::test]
async fn test_lease_expiry_at_retry_bound_stays_failed() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::Captioning;
    fx.tracker.smart_queue(kind, &ids, true).await.unwrap();
    fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap();

    let expired = fx
        .dispatcher
        .clone()
        .with_lease(chrono::Duration::seconds(-1));
    let mut item_id = None;
    for _ in 0..3 {
        let item = expired.claim_batch(kind, 1).await.unwrap().remove(0);
        assert_eq!(fx.dispatcher.release_expired_leases().await.unwrap(), 1);
        item_id = Some(item.id);
    }

    let item = fx.dispatcher.get(item_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert!(item.is_permanently_failed());

    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 0);
    fx.tracker.smart_queue(kind, &ids, false).await.unwrap();
    assert_eq!(fx.tracker.enqueue_flagged(kind, 0, "test", 10).await.unwrap(), 0);
    let stats = fx.dispatcher.stats(kind).await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.permanently_failed, 1);
}

#[tokio::test]
async fn test_expired_lease_returns_item_to_pending() {
    let fx = Fixture::new();
    let ids = fx.images(1).await;
    let kind = EnrichmentKind::Embedding;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();

    let expired = fx
        .dispatcher
        .clone()
        .with_lease(chrono::Duration::seconds(-1));
    let item = expired.claim_batch(kind, 1).await.unwrap().remove(0);

    assert_eq!(fx.dispatcher.release_expired_leases().await.unwrap(), 1);
    let item = fx.dispatcher.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert!(item.lease_owner.is_none());
    assert_eq!(
        item.error_message.as_deref(),
        Some(lumen_db::LEASE_EXPIRED_MESSAGE)
    );

    // A live lease is left alone
    fx.dispatcher.claim_batch(kind, 1).await.unwrap();
    assert_eq!(fx.dispatcher.release_expired_leases().await.unwrap(), 0);
}

#[tokio::test]
async fn test_clear_completed_and_clear_all() {
    let fx = Fixture::new();
    let ids = fx.images(3).await;
    let kind = EnrichmentKind::Tagging;
    fx.dispatcher.enqueue(kind, &ids, 0, "test").await.unwrap();
    let claimed = fx.dispatcher.claim_batch(kind, 2).await.unwrap();
    fx.dispatcher.complete(claimed[0].id).await.unwrap();
    fx.dispatcher.fail(claimed[1].id, "nope").await.unwrap();

    assert_eq!(fx.dispatcher.clear_completed(Some(kind)).await.unwrap(), 2);
    assert_eq!(fx.dispatcher.stats(kind).await.unwrap().total(), 1);
    assert_eq!(fx.dispatcher.clear_all(None).await.unwrap(), 1);
    assert_eq!(fx.dispatcher.stats(kind).await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_worker_lifecycle_is_persisted() {
    let fx = Fixture::new();
    let kind = EnrichmentKind::Captioning;
    // A second dispatcher over the same store sees every change
    let other = QueueDispatcher::new(Arc::clone(&fx.repos.queue), Arc::clone(&fx.repos.workers));

    assert_eq!(
        other.worker_state(kind).await.unwrap().status,
        WorkerStatus::Stopped
    );
    let running = fx.dispatcher.start(kind).await.unwrap();
    assert!(running.started_at.is_some());
    assert_eq!(
        other.worker_state(kind).await.unwrap().status,
        WorkerStatus::Running
    );

    fx.dispatcher.increment_counters(kind, 3, 1).await.unwrap();
    other.increment_counters(kind, 2, 0).await.unwrap();
    fx.dispatcher.record_error(kind, "gpu oom").await.unwrap();
    let paused = other.pause(kind).await.unwrap();
    assert_eq!(paused.status, WorkerStatus::Paused);

    let state = fx.dispatcher.worker_state(kind).await.unwrap();
    assert_eq!(state.processed_count, 5);
    assert_eq!(state.failed_count, 1);
    assert_eq!(state.last_error.as_deref(), Some("gpu oom"));
    assert!(state.paused_at.is_some());

    fx.dispatcher.reset_counters(kind).await.unwrap();
    let stopped = fx.dispatcher.stop(kind).await.unwrap();
    assert_eq!(stopped.status, WorkerStatus::Stopped);
    assert_eq!(stopped.processed_count, 0);
    assert_eq!(stopped.last_error.as_deref(), Some("gpu oom"));
}
