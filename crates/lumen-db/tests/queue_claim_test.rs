//! PostgreSQL claim semantics: SKIP LOCKED batches, completion, retry bound
//! and lease expiry.

use std::collections::HashSet;

use chrono::Duration;
use lumen_core::{
    ClaimRequest, CompletionOutcome, EnrichmentKind, Error, ImageRepository, QueueItemStatus,
    QueueRepository, TaskState,
};
use lumen_db::test_fixtures::TestDatabase;
use lumen_db::LEASE_EXPIRED_MESSAGE;

// Far above anything other tests queue, so these items are claimed first.
const TEST_PRIORITY: i32 = 1_000_000;

#[tokio::test]
async fn test_concurrent_claims_never_overlap() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_concurrent_claims_never_overlap").await
    else {
        return;
    };
    let ids = test_db.insert_images(20).await;
    let queued = test_db
        .db
        .queue
        .enqueue(EnrichmentKind::Captioning, &ids, TEST_PRIORITY, "test")
        .await
        .unwrap();
    assert_eq!(queued, 20);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let db = test_db.db.clone();
        handles.push(tokio::spawn(async move {
            db.queue
                .claim_batch(&ClaimRequest::new(
                    EnrichmentKind::Captioning,
                    5,
                    format!("worker-{worker}"),
                ))
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for item in handle.await.unwrap() {
            assert!(seen.insert(item.id), "item {} claimed twice", item.id);
            assert_eq!(item.status, QueueItemStatus::Processing);
            assert!(item.lease_owner.is_some());
        }
    }
    assert_eq!(seen.len(), 20);

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_complete_sets_flag_and_is_idempotent() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_complete_sets_flag_and_is_idempotent").await
    else {
        return;
    };
    let ids = test_db.insert_images(1).await;
    test_db
        .db
        .queue
        .enqueue(EnrichmentKind::Tagging, &ids, TEST_PRIORITY, "test")
        .await
        .unwrap();

    let claimed = test_db
        .db
        .queue
        .claim_batch(&ClaimRequest::new(EnrichmentKind::Tagging, 1, "worker"))
        .await
        .unwrap();
    let item = claimed.into_iter().find(|i| i.image_id == ids[0]).unwrap();

    assert_eq!(
        test_db.db.queue.complete(item.id).await.unwrap(),
        CompletionOutcome::Completed
    );
    assert_eq!(
        test_db.db.queue.complete(item.id).await.unwrap(),
        CompletionOutcome::AlreadyCompleted
    );

    let image = test_db.db.images.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(image.states.tagging, TaskState::Completed);

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_fail_on_pending_item_is_rejected() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_fail_on_pending_item_is_rejected").await
    else {
        return;
    };
    let ids = test_db.insert_images(1).await;
    test_db
        .db
        .queue
        .enqueue(EnrichmentKind::FaceDetection, &ids, 0, "test")
        .await
        .unwrap();
    let item = test_db
        .db
        .queue
        .list(Some(EnrichmentKind::FaceDetection), Some(QueueItemStatus::Pending), 1000)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.image_id == ids[0])
        .unwrap();

    let err = test_db.db.queue.fail(item.id, "boom").await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { ref from, .. } if from == "pending"));

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_expired_lease_returns_to_pending() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_expired_lease_returns_to_pending").await
    else {
        return;
    };
    let ids = test_db.insert_images(1).await;
    test_db
        .db
        .queue
        .enqueue(EnrichmentKind::Embedding, &ids, TEST_PRIORITY, "test")
        .await
        .unwrap();

    // A negative lease is already expired when written.
    let request = ClaimRequest::new(EnrichmentKind::Embedding, 1, "crashed-worker")
        .with_lease(Duration::seconds(-1));
    let claimed = test_db.db.queue.claim_batch(&request).await.unwrap();
    let item = claimed.into_iter().find(|i| i.image_id == ids[0]).unwrap();

    assert!(test_db.db.queue.release_expired_leases().await.unwrap() >= 1);

    let item = test_db.db.queue.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueItemStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.error_message.as_deref(), Some(LEASE_EXPIRED_MESSAGE));
    assert!(item.lease_owner.is_none());

    test_db.cleanup().await;
}
