//! Duplicate clustering service over a [`SimilarityRepository`].
//!
//! Candidate generation pages through every image with a visual embedding,
//! asks the vector index for its nearest neighbours and keeps pairs above the
//! threshold. The pairs are then grouped transitively by [`cluster_pairs`].
//! Variant detection runs the two metadata heuristics over the same catalog.
//! All three outputs are separate signals.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::defaults::{
    PROMPT_PREFIX_CHARS, SIMILARITY_NEIGHBOURS, SIMILARITY_THRESHOLD, SWEEP_PAGE_SIZE,
    UPSCALE_RATIO_MAX, UPSCALE_RATIO_MIN,
};
use lumen_core::{
    DuplicateCluster, Error, ImageDescriptor, Result, SimilarPair, SimilarityRepository,
    VariantPair,
};
use lumen_db::dedupe_pairs;

use crate::clustering::cluster_pairs;
use crate::heuristics::{
    FilenamePatternDetector, ParameterGroupDetector, ParameterGrouping, DEFAULT_VARIANT_SUFFIXES,
};
use crate::hnsw_tuning::{compute_ef, estimated_recall, HnswTuningConfig, RecallTarget};

/// Clustering and variant detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Minimum cosine similarity of a candidate pair.
    pub threshold: f32,
    /// Nearest neighbours requested per image.
    pub neighbours: i64,
    /// Images per index round trip.
    pub page_size: i64,
    pub recall_target: RecallTarget,
    pub tuning: HnswTuningConfig,
    pub grouping: ParameterGrouping,
    pub prompt_prefix_chars: usize,
    pub ratio_min: f64,
    pub ratio_max: f64,
    pub variant_suffixes: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold: SIMILARITY_THRESHOLD,
            neighbours: SIMILARITY_NEIGHBOURS,
            page_size: SWEEP_PAGE_SIZE,
            recall_target: RecallTarget::default(),
            tuning: HnswTuningConfig::default(),
            grouping: ParameterGrouping::default(),
            prompt_prefix_chars: PROMPT_PREFIX_CHARS,
            ratio_min: UPSCALE_RATIO_MIN,
            ratio_max: UPSCALE_RATIO_MAX,
            variant_suffixes: DEFAULT_VARIANT_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_neighbours(mut self, neighbours: i64) -> Self {
        self.neighbours = neighbours;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_recall_target(mut self, target: RecallTarget) -> Self {
        self.recall_target = target;
        self
    }

    pub fn with_tuning(mut self, tuning: HnswTuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_grouping(mut self, grouping: ParameterGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn with_ratio_range(mut self, min: f64, max: f64) -> Self {
        self.ratio_min = min;
        self.ratio_max = max;
        self
    }

    pub fn with_variant_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.variant_suffixes = suffixes;
        self
    }

    /// Reject settings that cannot produce meaningful results.
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "similarity threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.neighbours < 1 {
            return Err(Error::Config("neighbours must be at least 1".into()));
        }
        if self.page_size < 1 {
            return Err(Error::Config("page size must be at least 1".into()));
        }
        if !(self.ratio_min > 0.0 && self.ratio_min <= self.ratio_max) {
            return Err(Error::Config(format!(
                "invalid upscale ratio range [{}, {}]",
                self.ratio_min, self.ratio_max
            )));
        }
        Ok(())
    }
}

/// Finds near-duplicate clusters and draft/final variants.
pub struct SimilarityClusterer {
    repo: Arc<dyn SimilarityRepository>,
    config: ClusterConfig,
    filenames: FilenamePatternDetector,
    parameters: ParameterGroupDetector,
}

impl SimilarityClusterer {
    pub fn new(repo: Arc<dyn SimilarityRepository>, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let filenames = FilenamePatternDetector::with_suffixes(&config.variant_suffixes)?;
        let parameters = ParameterGroupDetector::new()
            .with_grouping(config.grouping)
            .with_prompt_prefix_chars(config.prompt_prefix_chars)
            .with_ratio_range(config.ratio_min, config.ratio_max);
        Ok(Self {
            repo,
            config,
            filenames,
            parameters,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// ef_search for the current corpus.
    pub async fn ef_search(&self) -> Result<u32> {
        let corpus = self.repo.visual_corpus_size().await?;
        Ok(compute_ef(
            self.config.recall_target,
            corpus,
            self.config.neighbours,
            &self.config.tuning,
        ))
    }

    /// Every pair of images at or above the similarity threshold.
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires between pages.
    pub async fn candidate_pairs(&self, cancel: &CancellationToken) -> Result<Vec<SimilarPair>> {
        let start = Instant::now();
        let ef = self.ef_search().await?;
        debug!(
            subsystem = "search",
            component = "clusterer",
            op = "candidate_pairs",
            ef_search = ef,
            estimated_recall = estimated_recall(ef),
            threshold = self.config.threshold,
            "Starting candidate generation"
        );

        let mut pairs = Vec::new();
        let mut after: Option<Uuid> = None;
        let mut scanned = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("duplicate candidate generation".into()));
            }
            let page = self
                .repo
                .visual_image_ids(after, self.config.page_size)
                .await?;
            let Some(&last) = page.last() else {
                break;
            };
            pairs.extend(
                self.repo
                    .nearest_pairs(&page, self.config.neighbours, self.config.threshold, ef)
                    .await?,
            );
            scanned += page.len();
            after = Some(last);
            if (page.len() as i64) < self.config.page_size {
                break;
            }
        }

        let pairs = dedupe_pairs(pairs);
        info!(
            subsystem = "search",
            component = "clusterer",
            op = "candidate_pairs",
            requested = scanned,
            affected = pairs.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Generated duplicate candidates"
        );
        Ok(pairs)
    }

    /// Group the current candidate pairs into clusters.
    pub async fn find_clusters(&self, cancel: &CancellationToken) -> Result<Vec<DuplicateCluster>> {
        let pairs = self.candidate_pairs(cancel).await?;
        self.cluster(&pairs).await
    }

    /// Cluster already generated pairs, loading dimensions for the preferred pick.
    pub async fn cluster(&self, pairs: &[SimilarPair]) -> Result<Vec<DuplicateCluster>> {
        let ids: Vec<Uuid> = pairs
            .iter()
            .flat_map(|p| [p.a, p.b])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dims = if ids.is_empty() {
            Vec::new()
        } else {
            self.repo.dimensions(&ids).await?
        };
        let clusters = cluster_pairs(pairs, &dims);
        debug!(
            subsystem = "search",
            component = "clusterer",
            op = "cluster",
            requested = pairs.len(),
            group_count = clusters.len(),
            "Clustered candidate pairs"
        );
        Ok(clusters)
    }

    /// Replace the persisted clusters.
    pub async fn materialize(&self, clusters: &[DuplicateCluster]) -> Result<u64> {
        let stored = self.repo.materialize_clusters(clusters).await?;
        info!(
            subsystem = "search",
            component = "clusterer",
            op = "materialize",
            group_count = stored,
            "Materialized duplicate clusters"
        );
        Ok(stored)
    }

    /// Read the persisted clusters.
    pub async fn materialized(&self) -> Result<Vec<DuplicateCluster>> {
        self.repo.materialized_clusters().await
    }

    /// Images eligible for variant detection, loaded page by page.
    pub async fn variant_candidates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ImageDescriptor>> {
        let mut out = Vec::new();
        let mut after: Option<Uuid> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("variant candidate scan".into()));
            }
            let page = self
                .repo
                .variant_candidates(after, self.config.page_size)
                .await?;
            let Some(last) = page.last().map(|d| d.id) else {
                break;
            };
            let full = page.len() as i64 >= self.config.page_size;
            out.extend(page);
            after = Some(last);
            if !full {
                break;
            }
        }
        Ok(out)
    }

    /// Pairs found by the filename-suffix heuristic.
    pub async fn filename_variants(&self, cancel: &CancellationToken) -> Result<Vec<VariantPair>> {
        let candidates = self.variant_candidates(cancel).await?;
        let pairs = self.filenames.detect(&candidates);
        self.log_variants("filename_variants", candidates.len(), pairs.len());
        Ok(pairs)
    }

    /// Pairs found by the parameter-group heuristic.
    pub async fn parameter_variants(&self, cancel: &CancellationToken) -> Result<Vec<VariantPair>> {
        let candidates = self.variant_candidates(cancel).await?;
        let pairs = self.parameters.detect(&candidates);
        self.log_variants("parameter_variants", candidates.len(), pairs.len());
        Ok(pairs)
    }

    fn log_variants(&self, op: &str, scanned: usize, found: usize) {
        info!(
            subsystem = "search",
            component = "clusterer",
            op,
            requested = scanned,
            affected = found,
            "Detected variant pairs"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threshold, 0.95);
        assert_eq!(config.neighbours, 10);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(ClusterConfig::new().with_threshold(0.0).validate().is_err());
        assert!(ClusterConfig::new().with_threshold(1.5).validate().is_err());
        assert!(ClusterConfig::new().with_threshold(1.0).validate().is_ok());
    }

    #[test]
    fn test_invalid_paging_rejected() {
        assert!(ClusterConfig::new().with_neighbours(0).validate().is_err());
        assert!(ClusterConfig::new().with_page_size(0).validate().is_err());
    }

    #[test]
    fn test_inverted_ratio_range_rejected() {
        assert!(ClusterConfig::new()
            .with_ratio_range(2.2, 1.8)
            .validate()
            .is_err());
    }
}
