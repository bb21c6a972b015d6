//! `hnsw.ef_search` tuning for duplicate candidate generation.
//!
//! Candidate generation asks the HNSW index for the `k` nearest neighbours
//! of every image. pgvector returns at most `ef_search` rows per scan, so the
//! search width must grow with the corpus and never drop below `k`.

use serde::{Deserialize, Serialize};

/// Corpus size at which the base width applies unscaled.
const REFERENCE_CORPUS: f32 = 10_000.0;

/// Recall target levels for candidate generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallTarget {
    /// Moderate recall (~85%)
    Fast,
    /// Balanced recall/latency (~92%)
    #[default]
    Balanced,
    /// High recall (~96%)
    High,
    /// Maximum recall (~99%)
    Exhaustive,
}

impl RecallTarget {
    /// Base ef_search for a corpus of up to 10k vectors.
    pub fn base_ef(&self) -> u32 {
        match self {
            RecallTarget::Fast => 20,
            RecallTarget::Balanced => 40,
            RecallTarget::High => 100,
            RecallTarget::Exhaustive => 200,
        }
    }
}

impl std::str::FromStr for RecallTarget {
    type Err = lumen_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(RecallTarget::Fast),
            "balanced" => Ok(RecallTarget::Balanced),
            "high" => Ok(RecallTarget::High),
            "exhaustive" => Ok(RecallTarget::Exhaustive),
            other => Err(lumen_core::Error::InvalidInput(format!(
                "unknown recall target: {other}"
            ))),
        }
    }
}

/// Bounds and scaling for ef_search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswTuningConfig {
    /// Scaling factor applied to log2(corpus / 10k)
    pub corpus_scale_factor: f32,
    /// Minimum ef_search value
    pub min_ef: u32,
    /// Maximum ef_search value (pgvector caps it at 1000)
    pub max_ef: u32,
}

impl Default for HnswTuningConfig {
    fn default() -> Self {
        Self {
            corpus_scale_factor: 1.0,
            min_ef: 10,
            max_ef: 500,
        }
    }
}

/// ef_search for a kNN scan of `neighbours` results over `corpus_size` vectors.
///
/// # Algorithm
/// ef = base_ef * max(1.0, 1.0 + log2(corpus_size / 10000) * scale_factor),
/// clamped to [max(min_ef, neighbours), max_ef].
pub fn compute_ef(
    target: RecallTarget,
    corpus_size: i64,
    neighbours: i64,
    config: &HnswTuningConfig,
) -> u32 {
    let base = target.base_ef() as f32;

    let size_ratio = corpus_size.max(0) as f32 / REFERENCE_CORPUS;
    let scale = if size_ratio > 1.0 {
        size_ratio.log2() * config.corpus_scale_factor
    } else {
        0.0
    };

    let ef = (base * (1.0 + scale).max(1.0)).round() as u32;

    let floor = u32::try_from(neighbours.max(0))
        .unwrap_or(u32::MAX)
        .max(config.min_ef);
    let ceiling = config.max_ef.max(floor);
    ef.clamp(floor, ceiling)
}

/// Heuristic recall for an ef_search value: 1 - 1 / (1 + ef / 20).
pub fn estimated_recall(ef: u32) -> f32 {
    1.0 - 1.0 / (1.0 + (ef as f32 / 20.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recall_target_base_ef() {
        assert_eq!(RecallTarget::Fast.base_ef(), 20);
        assert_eq!(RecallTarget::Balanced.base_ef(), 40);
        assert_eq!(RecallTarget::High.base_ef(), 100);
        assert_eq!(RecallTarget::Exhaustive.base_ef(), 200);
        assert_eq!(RecallTarget::default(), RecallTarget::Balanced);
    }

    #[test]
    fn test_recall_target_parse() {
        assert_eq!("high".parse::<RecallTarget>().unwrap(), RecallTarget::High);
        assert!("perfect".parse::<RecallTarget>().is_err());
    }

    #[test]
    fn test_small_corpus_uses_base() {
        let config = HnswTuningConfig::default();
        assert_eq!(compute_ef(RecallTarget::Balanced, 5_000, 10, &config), 40);
        assert_eq!(compute_ef(RecallTarget::Balanced, 0, 10, &config), 40);
    }

    #[test]
    fn test_medium_corpus_scales_logarithmically() {
        let config = HnswTuningConfig::default();
        // log2(4) = 2, 40 * (1 + 2) = 120
        assert_eq!(compute_ef(RecallTarget::Balanced, 40_000, 10, &config), 120);
        // log2(16) = 4, 40 * 5 = 200
        assert_eq!(compute_ef(RecallTarget::Balanced, 160_000, 10, &config), 200);
    }

    #[test]
    fn test_exhaustive_clamped_to_max() {
        let config = HnswTuningConfig::default();
        assert_eq!(compute_ef(RecallTarget::Exhaustive, 40_000, 10, &config), 500);
    }

    #[test]
    fn test_never_below_neighbour_count() {
        let config = HnswTuningConfig::default();
        assert_eq!(compute_ef(RecallTarget::Fast, 100, 64, &config), 64);
    }

    #[test]
    fn test_neighbours_above_max_win() {
        let config = HnswTuningConfig {
            max_ef: 50,
            ..Default::default()
        };
        assert_eq!(compute_ef(RecallTarget::High, 1_000_000, 80, &config), 80);
    }

    #[test]
    fn test_custom_scale_factor() {
        let config = HnswTuningConfig {
            corpus_scale_factor: 0.5,
            ..Default::default()
        };
        // log2(4) * 0.5 = 1, 40 * 2 = 80
        assert_eq!(compute_ef(RecallTarget::Balanced, 40_000, 10, &config), 80);
    }

    #[test]
    fn test_estimated_recall_monotonic() {
        assert!((estimated_recall(40) - 0.667).abs() < 0.01);
        assert!(estimated_recall(10) < estimated_recall(40));
        assert!(estimated_recall(40) < estimated_recall(200));
    }
}
