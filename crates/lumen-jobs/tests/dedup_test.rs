//! Fingerprinting, propagation, repair and the embedding cache against the
//! in-memory store.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lumen_db::{MemoryStore, Repositories};
use lumen_jobs::{
    CacheContentKind, CacheLookup, Catalog, DedupCache, EnrichmentKind, GenerationParams,
    NewImage, QueueDispatcher, TaskState, TaskStateTracker, Vector,
};

fn params(seed: i64) -> GenerationParams {
    GenerationParams {
        prompt: Some("a lighthouse at dusk, volumetric fog".to_string()),
        model: Some("sdxl-base-1.0".to_string()),
        seed: Some(seed),
        steps: Some(30),
        sampler: Some("dpmpp_2m".to_string()),
        cfg_scale: Some(7.0),
        width: Some(1024),
        height: Some(1024),
        ..Default::default()
    }
}

fn vector(seed: f32) -> Vector {
    Vector::from(vec![seed, 1.0 - seed, 0.5])
}

struct Fixture {
    store: MemoryStore,
    repos: Repositories,
    dedup: DedupCache,
    catalog: Catalog,
}

impl Fixture {
    fn new() -> Self {
        let store = MemoryStore::new();
        let repos = Repositories::memory(store.clone());
        Self {
            dedup: DedupCache::from_repositories(&repos).with_page_size(2),
            catalog: Catalog::from_repositories(&repos),
            store,
            repos,
        }
    }

    async fn image(&self, name: &str, size: i64, seed: i64) -> Uuid {
        self.repos
            .images
            .insert(NewImage::new(name, size).with_params(params(seed)))
            .await
            .unwrap()
    }

    /// Fingerprint and elect in one go.
    async fn group(&self) {
        let cancel = CancellationToken::new();
        self.dedup.compute_fingerprints(&cancel).await.unwrap();
        self.dedup.elect_representatives(&cancel).await.unwrap();
    }
}

#[tokio::test]
async fn test_larger_file_becomes_representative_and_lends_vectors() {
    let fx = Fixture::new();
    let small = fx.image("lighthouse.png", 1_500_000, 42).await;
    let large = fx.image("lighthouse_copy.png", 2_000_000, 42).await;
    let unrelated = fx.image("harbor.png", 3_000_000, 7).await;

    fx.group().await;
    fx.repos
        .images
        .set_embeddings(large, Some(vector(0.1)), Some(vector(0.9)))
        .await
        .unwrap();

    let report = fx
        .dedup
        .propagate_embeddings(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.representatives_visited, 1);
    assert_eq!(report.images_updated, 1);
    assert!(!report.cancelled);

    let rep = fx.repos.images.get(large).await.unwrap().unwrap();
    assert!(rep.is_embedding_representative);
    assert_eq!(rep.embedding_source_id, Some(large));

    let member = fx.repos.images.get(small).await.unwrap().unwrap();
    assert!(!member.is_embedding_representative);
    assert_eq!(member.embedding_source_id, Some(large));
    assert_eq!(member.text_embedding, rep.text_embedding);
    assert_eq!(member.visual_embedding, rep.visual_embedding);
    assert_eq!(member.states.embedding, TaskState::Completed);

    let other = fx.repos.images.get(unrelated).await.unwrap().unwrap();
    assert!(!other.is_embedding_representative);
    assert!(other.embedding_source_id.is_none());
}

#[tokio::test]
async fn test_propagation_is_idempotent() {
    let fx = Fixture::new();
    let rep = fx.image("a.png", 900, 1).await;
    for n in 0..3 {
        fx.image(&format!("a_{n}.png"), 100 + n, 1).await;
    }
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, None, Some(vector(0.3)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let first = fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    assert_eq!(first.images_updated, 3);
    let second = fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    assert_eq!(second.representatives_visited, 1);
    assert_eq!(second.images_updated, 0);

    // Re-electing an unchanged group changes nothing either
    assert_eq!(fx.dedup.elect_representatives(&cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn test_representative_without_vectors_is_reported() {
    let fx = Fixture::new();
    fx.image("a.png", 10, 5).await;
    fx.image("b.png", 20, 5).await;
    fx.group().await;

    let report = fx
        .dedup
        .propagate_embeddings(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.representatives_without_vectors, 1);
    assert_eq!(report.images_updated, 0);
}

#[tokio::test]
async fn test_cancelled_propagation_stops_before_work() {
    let fx = Fixture::new();
    let rep = fx.image("a.png", 10, 5).await;
    fx.image("b.png", 5, 5).await;
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, Some(vector(0.2)), None)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.images_updated, 0);
}

#[tokio::test]
async fn test_images_without_generation_data_are_not_fingerprinted() {
    let fx = Fixture::new();
    fx.repos
        .images
        .insert(NewImage::new("scan.png", 10))
        .await
        .unwrap();
    fx.image("a.png", 10, 5).await;

    let stored = fx
        .dedup
        .compute_fingerprints(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn test_deleting_representative_leaves_no_dangling_references() {
    let fx = Fixture::new();
    let rep = fx.image("big.png", 5_000, 9).await;
    let a = fx.image("a.png", 100, 9).await;
    let b = fx.image("b.png", 200, 9).await;
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, Some(vector(0.4)), Some(vector(0.6)))
        .await
        .unwrap();
    fx.dedup
        .propagate_embeddings(&CancellationToken::new())
        .await
        .unwrap();

    let report = fx.catalog.delete_images(&[rep]).await.unwrap();
    assert_eq!(report.representatives, vec![rep]);
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(report.affected_images, expected);
    assert!(fx.dedup.dangling_references().await.unwrap().is_empty());

    for id in [a, b] {
        let image = fx.repos.images.get(id).await.unwrap().unwrap();
        assert!(image.embedding_source_id.is_none());
        assert!(image.visual_embedding.is_none());
        assert_eq!(image.states.embedding, TaskState::NeverQueued);
    }

    // Orphans are picked up again by the ordinary queue path
    let tracker = TaskStateTracker::from_repositories(&fx.repos);
    let outcome = tracker
        .smart_queue(EnrichmentKind::Embedding, &report.affected_images, true)
        .await
        .unwrap();
    assert_eq!(outcome.transitioned, 2);
}

#[tokio::test]
async fn test_deleting_representative_drops_its_queue_rows() {
    let fx = Fixture::new();
    let rep = fx.image("big.png", 5_000, 9).await;
    fx.image("small.png", 100, 9).await;
    fx.group().await;

    let dispatcher = QueueDispatcher::from_repositories(&fx.repos);
    dispatcher
        .enqueue(EnrichmentKind::Embedding, &[rep], 0, "test")
        .await
        .unwrap();
    fx.catalog.delete_images(&[rep]).await.unwrap();

    let stats = dispatcher.stats(EnrichmentKind::Embedding).await.unwrap();
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
async fn test_repair_orphans_without_delete() {
    let fx = Fixture::new();
    let rep = fx.image("big.png", 5_000, 3).await;
    let member = fx.image("small.png", 100, 3).await;
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, Some(vector(0.5)), None)
        .await
        .unwrap();
    fx.dedup
        .propagate_embeddings(&CancellationToken::new())
        .await
        .unwrap();

    let report = fx.dedup.repair_orphans(&[rep]).await.unwrap();
    assert_eq!(report.affected_images, vec![member]);
    let rep_row = fx.repos.images.get(rep).await.unwrap().unwrap();
    assert!(!rep_row.is_embedding_representative);
    assert!(rep_row.text_embedding.is_some());
    assert!(fx.dedup.dangling_references().await.unwrap().is_empty());

    assert!(fx.dedup.repair_orphans(&[]).await.unwrap().affected_images.is_empty());
}

#[tokio::test]
async fn test_repair_all_dangling_sweeps_without_ids() {
    let fx = Fixture::new();
    let rep = fx.image("big.png", 5_000, 4).await;
    let member = fx.image("small.png", 100, 4).await;
    let stray = fx.image("restored.png", 100, 11).await;
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, Some(vector(0.5)), None)
        .await
        .unwrap();
    fx.dedup
        .propagate_embeddings(&CancellationToken::new())
        .await
        .unwrap();

    let clean = fx.dedup.repair_all_dangling().await.unwrap();
    assert!(clean.representatives.is_empty());
    assert!(clean.affected_images.is_empty());

    // One borrower of a vanished source, one of a live non-representative
    let vanished = Uuid::now_v7();
    fx.store.force_embedding_source(stray, vanished).unwrap();
    fx.store.force_embedding_source(member, stray).unwrap();
    let mut dangling = vec![member, stray];
    dangling.sort();
    assert_eq!(fx.dedup.dangling_references().await.unwrap(), dangling);

    let report = fx.dedup.repair_all_dangling().await.unwrap();
    let mut sources = vec![vanished, stray];
    sources.sort();
    assert_eq!(report.representatives, sources);
    assert_eq!(report.affected_images, dangling);
    assert!(fx.dedup.dangling_references().await.unwrap().is_empty());

    let repaired = fx.repos.images.get(member).await.unwrap().unwrap();
    assert!(repaired.embedding_source_id.is_none());
    assert!(repaired.text_embedding.is_none());
    assert_eq!(repaired.states.embedding, TaskState::NeverQueued);
    // The live representative is untouched
    let rep_row = fx.repos.images.get(rep).await.unwrap().unwrap();
    assert!(rep_row.is_embedding_representative);
}

#[tokio::test]
async fn test_representative_reembedded_through_cache_refreshes_borrowers() {
    let fx = Fixture::new();
    let rep = fx.image("big.png", 5_000, 6).await;
    let member = fx.image("small.png", 100, 6).await;
    fx.group().await;
    fx.repos
        .images
        .set_embeddings(rep, Some(vector(0.1)), None)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    assert_eq!(fx.dedup.propagate_embeddings(&cancel).await.unwrap().images_updated, 1);

    fx.dedup
        .store_embedding(rep, CacheContentKind::Text, b"revised caption", vector(0.8))
        .await
        .unwrap();
    let rep_row = fx.repos.images.get(rep).await.unwrap().unwrap();
    assert_eq!(rep_row.text_embedding, Some(vector(0.8)));
    assert_eq!(rep_row.embedding_source_id, Some(rep));
    let stale = fx.repos.images.get(member).await.unwrap().unwrap();
    assert!(stale.embedding_source_id.is_none());

    let report = fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    assert_eq!(report.images_updated, 1);
    let refreshed = fx.repos.images.get(member).await.unwrap().unwrap();
    assert_eq!(refreshed.embedding_source_id, Some(rep));
    assert_eq!(refreshed.text_embedding, Some(vector(0.8)));

    // A cache hit on the representative detaches borrowers the same way
    fx.dedup
        .store_embedding(member, CacheContentKind::Text, b"other caption", vector(0.3))
        .await
        .unwrap();
    fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    assert!(fx
        .dedup
        .cached_embedding(rep, CacheContentKind::Text, b"other caption")
        .await
        .unwrap()
        .is_hit());
    assert!(fx
        .repos
        .images
        .get(member)
        .await
        .unwrap()
        .unwrap()
        .embedding_source_id
        .is_none());
    fx.dedup.propagate_embeddings(&cancel).await.unwrap();
    let member_row = fx.repos.images.get(member).await.unwrap().unwrap();
    assert_eq!(member_row.text_embedding, Some(vector(0.3)));
    assert_eq!(member_row.embedding_source_id, Some(rep));
}

#[tokio::test]
async fn test_embedding_cache_hit_miss_and_refcount() {
    let fx = Fixture::new();
    let first = fx.image("a.png", 10, 1).await;
    let second = fx.image("b.png", 10, 2).await;
    let content = b"a lighthouse at dusk";
    let kind = CacheContentKind::Text;

    assert!(matches!(
        fx.dedup.cached_embedding(first, kind, content).await.unwrap(),
        CacheLookup::Miss
    ));
    let entry = fx
        .dedup
        .store_embedding(first, kind, content, vector(0.7))
        .await
        .unwrap();
    assert_eq!(entry.ref_count, 1);

    let CacheLookup::Hit(hit) = fx.dedup.cached_embedding(second, kind, content).await.unwrap()
    else {
        panic!("expected a cache hit");
    };
    assert_eq!(hit.ref_count, 2);
    let image = fx.repos.images.get(second).await.unwrap().unwrap();
    assert_eq!(image.text_embedding, Some(vector(0.7)));

    // Linking the same content twice does not double count
    fx.dedup.cached_embedding(second, kind, content).await.unwrap();
    let entry = fx
        .repos
        .cache
        .get(kind, &entry.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.ref_count, 2);

    // Same bytes under the other content kind are a separate entry
    assert!(!fx
        .dedup
        .cached_embedding(first, CacheContentKind::Pixels, content)
        .await
        .unwrap()
        .is_hit());
}

#[tokio::test]
async fn test_prune_keeps_referenced_entries() {
    let fx = Fixture::new();
    let image = fx.image("a.png", 10, 1).await;
    let kind = CacheContentKind::Pixels;
    let entry = fx
        .dedup
        .store_embedding(image, kind, b"pixels", vector(0.2))
        .await
        .unwrap();

    let immediately = Some(chrono::Duration::zero());
    assert_eq!(fx.dedup.prune_cache(immediately).await.unwrap(), 0);

    assert_eq!(fx.dedup.release_cache(image).await.unwrap(), 1);
    // Recently used entries survive the default window
    assert_eq!(fx.dedup.prune_cache(None).await.unwrap(), 0);
    assert_eq!(
        fx.dedup
            .prune_cache(Some(chrono::Duration::seconds(-1)))
            .await
            .unwrap(),
        1
    );
    assert!(fx
        .repos
        .cache
        .get(kind, &entry.content_hash)
        .await
        .unwrap()
        .is_none());
}
