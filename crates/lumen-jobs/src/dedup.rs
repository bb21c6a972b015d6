//! Embedding deduplication: fingerprints, representatives, propagation and
//! the content-addressed embedding cache.
//!
//! Images generated with identical parameters share one embedding. The
//! largest file of each fingerprint group is elected representative, its
//! vectors are copied to the other members, and deleting it repairs every
//! borrower in the same transaction as the delete.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lumen_core::defaults::{CACHE_PRUNE_AFTER_HOURS, SWEEP_PAGE_SIZE};
use lumen_core::{
    compute_content_hash, elect_representative, CacheContentKind, CacheLookup, DedupRepository,
    EmbeddingCacheEntry, EmbeddingCacheRepository, FingerprintPolicy, PropagationOutcome,
    PropagationReport, RepairReport, Result, StrictFingerprint, Vector,
};
use lumen_db::Repositories;

/// Fingerprinting, representative election, propagation and caching.
#[derive(Clone)]
pub struct DedupCache {
    dedup: Arc<dyn DedupRepository>,
    cache: Arc<dyn EmbeddingCacheRepository>,
    page_size: i64,
}

impl DedupCache {
    pub fn new(dedup: Arc<dyn DedupRepository>, cache: Arc<dyn EmbeddingCacheRepository>) -> Self {
        Self {
            dedup,
            cache,
            page_size: SWEEP_PAGE_SIZE,
        }
    }

    pub fn from_repositories(repos: &Repositories) -> Self {
        Self::new(repos.dedup.clone(), repos.cache.clone())
    }

    /// Rows handled between cancellation checks.
    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fingerprint every image that has generation data but no fingerprint.
    ///
    /// Stops early when `cancel` fires; the count covers pages already stored.
    pub async fn compute_fingerprints(&self, cancel: &CancellationToken) -> Result<u64> {
        let policy = StrictFingerprint;
        let mut stored = 0u64;
        while !cancel.is_cancelled() {
            let page = self.dedup.images_missing_fingerprint(self.page_size).await?;
            if page.is_empty() {
                break;
            }
            let values: Vec<(Uuid, String)> = page
                .iter()
                .filter(|src| src.params.has_generation_data())
                .map(|src| (src.id, policy.fingerprint(&src.params)))
                .collect();
            let written = self.dedup.set_fingerprints(&values).await?;
            stored += written;
            if written == 0 || (page.len() as i64) < self.page_size {
                break;
            }
        }
        info!(
            subsystem = "dedup",
            component = "fingerprint",
            op = "compute_fingerprints",
            policy = policy.name(),
            affected = stored,
            cancelled = cancel.is_cancelled(),
            "Computed fingerprints"
        );
        Ok(stored)
    }

    /// Elect one representative per fingerprint group.
    ///
    /// Largest file wins, lowest id breaks ties. Returns the number of groups
    /// whose representative changed.
    pub async fn elect_representatives(&self, cancel: &CancellationToken) -> Result<u64> {
        let mut after: Option<String> = None;
        let mut groups = 0u64;
        let mut changed = 0u64;
        while !cancel.is_cancelled() {
            let page = self
                .dedup
                .fingerprint_groups(after.as_deref(), self.page_size)
                .await?;
            let Some(last) = page.last().map(|g| g.fingerprint.clone()) else {
                break;
            };
            for group in &page {
                let Some(winner) = elect_representative(&group.members) else {
                    continue;
                };
                if self
                    .dedup
                    .mark_representative(&group.fingerprint, winner)
                    .await?
                {
                    changed += 1;
                }
            }
            groups += page.len() as u64;
            let full = page.len() as i64 >= self.page_size;
            after = Some(last);
            if !full {
                break;
            }
        }
        info!(
            subsystem = "dedup",
            component = "election",
            op = "elect_representatives",
            group_count = groups,
            affected = changed,
            cancelled = cancel.is_cancelled(),
            "Elected representatives"
        );
        Ok(changed)
    }

    /// Copy every representative's vectors to its group.
    ///
    /// Re-running is a no-op: members already pointing at their
    /// representative are not touched again.
    pub async fn propagate_embeddings(&self, cancel: &CancellationToken) -> Result<PropagationReport> {
        let start = Instant::now();
        let mut report = PropagationReport::default();
        let mut after: Option<Uuid> = None;

        'pages: loop {
            let page = self.dedup.representatives(after, self.page_size).await?;
            let Some(&last) = page.last() else {
                break;
            };
            for rep in &page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'pages;
                }
                match self.dedup.propagate_from(*rep).await? {
                    PropagationOutcome::NotRepresentative => continue,
                    PropagationOutcome::NoVectors => report.representatives_without_vectors += 1,
                    PropagationOutcome::Propagated(n) => report.images_updated += n,
                }
                report.representatives_visited += 1;
            }
            if (page.len() as i64) < self.page_size {
                break;
            }
            after = Some(last);
        }

        info!(
            subsystem = "dedup",
            component = "propagation",
            op = "propagate_embeddings",
            requested = report.representatives_visited,
            affected = report.images_updated,
            without_vectors = report.representatives_without_vectors,
            cancelled = report.cancelled,
            duration_ms = start.elapsed().as_millis() as u64,
            "Propagated embeddings"
        );
        Ok(report)
    }

    /// Clear every reference to the given representatives.
    ///
    /// Affected images return to `NeverQueued` for embedding; re-queue them
    /// with [`TaskStateTracker::smart_queue`](crate::TaskStateTracker::smart_queue).
    pub async fn repair_orphans(&self, representatives: &[Uuid]) -> Result<RepairReport> {
        if representatives.is_empty() {
            return Ok(RepairReport::default());
        }
        self.dedup.repair_orphans(representatives).await
    }

    /// Repair every dangling reference in the catalog.
    ///
    /// Suited to startup, after an external write may have left images
    /// borrowing from deleted or demoted sources. Sources that are not
    /// borrowers themselves are repaired first, so a chain is cleared from
    /// its root and every image on it returns to `NeverQueued`. A clean
    /// catalog yields an empty report.
    pub async fn repair_all_dangling(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut rounds = 0;
        loop {
            let sources = self.dedup.dangling_sources().await?;
            if sources.is_empty() {
                break;
            }
            let borrowers: HashSet<Uuid> =
                self.dedup.dangling_references().await?.into_iter().collect();
            let roots: Vec<Uuid> = sources
                .iter()
                .copied()
                .filter(|src| !borrowers.contains(src))
                .collect();
            // Only cycles are left when no source is a root.
            let batch = if roots.is_empty() { sources } else { roots };

            let round = self.dedup.repair_orphans(&batch).await?;
            report.representatives.extend(round.representatives);
            report.affected_images.extend(round.affected_images);
            rounds += 1;
        }
        report.representatives.sort();
        report.representatives.dedup();
        report.affected_images.sort();
        report.affected_images.dedup();

        if rounds > 0 {
            info!(
                subsystem = "dedup",
                component = "repair",
                op = "repair_all_dangling",
                requested = report.representatives.len(),
                affected = report.affected_images.len(),
                rounds,
                "Repaired dangling embedding references"
            );
        } else {
            debug!(
                subsystem = "dedup",
                component = "repair",
                op = "repair_all_dangling",
                "No dangling embedding references"
            );
        }
        Ok(report)
    }

    /// Images whose source is neither themselves nor a live representative.
    pub async fn dangling_references(&self) -> Result<Vec<Uuid>> {
        let dangling = self.dedup.dangling_references().await?;
        if !dangling.is_empty() {
            warn!(
                subsystem = "dedup",
                component = "repair",
                op = "dangling_references",
                affected = dangling.len(),
                "Found dangling embedding references"
            );
        }
        Ok(dangling)
    }

    // ─── Embedding cache ───────────────────────────────────────────────────

    /// Look `content` up in the cache. On a hit the vector is already on the image.
    pub async fn cached_embedding(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content: &[u8],
    ) -> Result<CacheLookup> {
        let hash = compute_content_hash(content);
        let lookup = self.cache.lookup_and_link(image_id, kind, &hash).await?;
        debug!(
            subsystem = "dedup",
            component = "cache",
            op = "lookup",
            image_id = %image_id,
            content_kind = kind.as_str(),
            hit = lookup.is_hit(),
            "Embedding cache lookup"
        );
        Ok(lookup)
    }

    /// Record a freshly computed vector for `content` and link it to the image.
    pub async fn store_embedding(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content: &[u8],
        vector: Vector,
    ) -> Result<EmbeddingCacheEntry> {
        let hash = compute_content_hash(content);
        self.cache.store(image_id, kind, &hash, vector).await
    }

    /// Drop the cache links held by an image.
    pub async fn release_cache(&self, image_id: Uuid) -> Result<u64> {
        self.cache.release(image_id).await
    }

    /// Delete unreferenced entries idle for longer than `max_age`.
    pub async fn prune_cache(&self, max_age: Option<chrono::Duration>) -> Result<u64> {
        let max_age = max_age.unwrap_or_else(|| chrono::Duration::hours(CACHE_PRUNE_AFTER_HOURS));
        let pruned = self.cache.prune_unreferenced(Utc::now() - max_age).await?;
        info!(
            subsystem = "dedup",
            component = "cache",
            op = "prune",
            affected = pruned,
            "Pruned embedding cache"
        );
        Ok(pruned)
    }
}
