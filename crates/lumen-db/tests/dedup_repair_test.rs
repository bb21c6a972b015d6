//! PostgreSQL representative election, propagation and orphan repair.

use lumen_core::{
    compute_content_hash, CacheContentKind, DedupRepository, EmbeddingCacheRepository,
    FingerprintPolicy, ImageRepository, NewImage, PropagationOutcome, StrictFingerprint,
    TaskState, Vector,
};
use lumen_db::test_fixtures::{sample_params, TestDatabase};

fn visual(seed: f32) -> Vector {
    Vector::from(vec![seed; lumen_core::defaults::VISUAL_EMBED_DIMENSION])
}

#[tokio::test]
async fn test_representative_propagates_and_delete_repairs() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_representative_propagates_and_delete_repairs").await
    else {
        return;
    };
    // Unique seed keeps this group apart from other test runs.
    let seed = chrono::Utc::now().timestamp_micros();
    let params = sample_params(seed);

    let small = test_db
        .insert_image(NewImage::new("small.png", 1_000).with_params(params.clone()))
        .await;
    let large = test_db
        .insert_image(NewImage::new("large.png", 5_000).with_params(params.clone()))
        .await;

    let fingerprint = StrictFingerprint.fingerprint(&params);
    test_db
        .db
        .dedup
        .set_fingerprints(&[(small, fingerprint.clone()), (large, fingerprint.clone())])
        .await
        .unwrap();
    assert!(test_db
        .db
        .dedup
        .mark_representative(&fingerprint, large)
        .await
        .unwrap());
    assert!(!test_db
        .db
        .dedup
        .mark_representative(&fingerprint, large)
        .await
        .unwrap());

    assert_eq!(
        test_db.db.dedup.propagate_from(large).await.unwrap(),
        PropagationOutcome::NoVectors
    );
    test_db
        .db
        .images
        .set_embeddings(large, None, Some(visual(0.5)))
        .await
        .unwrap();
    assert_eq!(
        test_db.db.dedup.propagate_from(large).await.unwrap(),
        PropagationOutcome::Propagated(1)
    );
    assert_eq!(
        test_db.db.dedup.propagate_from(large).await.unwrap(),
        PropagationOutcome::Propagated(0)
    );

    let borrowed = test_db.db.images.get(small).await.unwrap().unwrap();
    assert_eq!(borrowed.embedding_source_id, Some(large));
    assert_eq!(borrowed.visual_embedding, Some(visual(0.5)));
    assert_eq!(borrowed.states.embedding, TaskState::Completed);

    let report = test_db.db.images.delete_images(&[large]).await.unwrap();
    assert_eq!(report.representatives, vec![large]);
    assert_eq!(report.affected_images, vec![small]);

    let repaired = test_db.db.images.get(small).await.unwrap().unwrap();
    assert!(repaired.embedding_source_id.is_none());
    assert!(repaired.visual_embedding.is_none());
    assert_eq!(repaired.states.embedding, TaskState::NeverQueued);
    assert!(!test_db
        .db
        .dedup
        .dangling_references()
        .await
        .unwrap()
        .contains(&small));

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_recursive_folder_delete_repairs_outside_borrowers() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_recursive_folder_delete_repairs_outside_borrowers").await
    else {
        return;
    };
    let root = test_db.create_folder(None).await;
    let child = test_db.create_folder(Some(root)).await;

    let seed = chrono::Utc::now().timestamp_micros();
    let params = sample_params(seed);
    let inside = test_db
        .db
        .images
        .insert(NewImage::new("inside.png", 9_000).in_folder(child).with_params(params.clone()))
        .await
        .unwrap();
    let outside = test_db
        .insert_image(NewImage::new("outside.png", 10).with_params(params.clone()))
        .await;

    let fingerprint = StrictFingerprint.fingerprint(&params);
    test_db
        .db
        .dedup
        .set_fingerprints(&[(inside, fingerprint.clone()), (outside, fingerprint.clone())])
        .await
        .unwrap();
    test_db
        .db
        .dedup
        .mark_representative(&fingerprint, inside)
        .await
        .unwrap();
    test_db
        .db
        .images
        .set_embeddings(inside, None, Some(visual(0.25)))
        .await
        .unwrap();
    test_db.db.dedup.propagate_from(inside).await.unwrap();

    assert_eq!(
        test_db.db.images.folder_image_ids(root, true).await.unwrap(),
        vec![inside]
    );
    assert!(test_db
        .db
        .images
        .folder_image_ids(root, false)
        .await
        .unwrap()
        .is_empty());

    let report = test_db.db.images.delete_folder(root).await.unwrap();
    assert_eq!(report.affected_images, vec![outside]);
    assert!(test_db.db.images.get(inside).await.unwrap().is_none());

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_cache_write_on_representative_detaches_borrowers() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_cache_write_on_representative_detaches_borrowers").await
    else {
        return;
    };
    let seed = chrono::Utc::now().timestamp_micros();
    let params = sample_params(seed);
    let member = test_db
        .insert_image(NewImage::new("member.png", 10).with_params(params.clone()))
        .await;
    let rep = test_db
        .insert_image(NewImage::new("rep.png", 9_000).with_params(params.clone()))
        .await;

    let fingerprint = StrictFingerprint.fingerprint(&params);
    let dedup = &test_db.db.dedup;
    dedup
        .set_fingerprints(&[(member, fingerprint.clone()), (rep, fingerprint.clone())])
        .await
        .unwrap();
    dedup.mark_representative(&fingerprint, rep).await.unwrap();
    test_db
        .db
        .images
        .set_embeddings(rep, None, Some(visual(0.1)))
        .await
        .unwrap();
    dedup.propagate_from(rep).await.unwrap();

    let hash = compute_content_hash(format!("pixels-{seed}").as_bytes());
    test_db
        .db
        .cache
        .store(rep, CacheContentKind::Pixels, &hash, visual(0.9))
        .await
        .unwrap();
    let stale = test_db.db.images.get(member).await.unwrap().unwrap();
    assert!(stale.embedding_source_id.is_none());

    assert_eq!(
        test_db.db.dedup.propagate_from(rep).await.unwrap(),
        PropagationOutcome::Propagated(1)
    );
    let refreshed = test_db.db.images.get(member).await.unwrap().unwrap();
    assert_eq!(refreshed.visual_embedding, Some(visual(0.9)));
    assert_eq!(refreshed.embedding_source_id, Some(rep));

    test_db.cleanup().await;
}

#[tokio::test]
async fn test_dangling_sources_lists_demoted_sources() {
    let Some(mut test_db) =
        TestDatabase::from_env("test_dangling_sources_lists_demoted_sources").await
    else {
        return;
    };
    let ids = test_db.insert_images(3).await;
    let (demoted, first, second) = (ids[0], ids[1], ids[2]);

    // Borrowers of an image that is no representative, as an external
    // writer might leave them
    sqlx::query("UPDATE image SET embedding_source_id = $1 WHERE id = ANY($2)")
        .bind(demoted)
        .bind(vec![first, second])
        .execute(&test_db.db.pool)
        .await
        .unwrap();

    let sources = test_db.db.dedup.dangling_sources().await.unwrap();
    assert_eq!(sources.iter().filter(|s| **s == demoted).count(), 1);
    let dangling = test_db.db.dedup.dangling_references().await.unwrap();
    assert!(dangling.contains(&first));
    assert!(dangling.contains(&second));

    let report = test_db.db.dedup.repair_orphans(&[demoted]).await.unwrap();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(report.affected_images, expected);
    assert!(!test_db
        .db
        .dedup
        .dangling_sources()
        .await
        .unwrap()
        .contains(&demoted));

    test_db.cleanup().await;
}
