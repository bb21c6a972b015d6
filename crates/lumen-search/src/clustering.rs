//! Transitive grouping of similar pairs into duplicate clusters.

use std::collections::HashMap;

use uuid::Uuid;

use lumen_core::{DuplicateCluster, ImageDims, SimilarPair};

use crate::union_find::UnionFind;

#[derive(Debug, Clone, Copy)]
struct ClusterStats {
    min: f32,
    max: f32,
    strongest: SimilarPair,
}

impl ClusterStats {
    fn new(pair: SimilarPair) -> Self {
        Self {
            min: pair.similarity,
            max: pair.similarity,
            strongest: pair,
        }
    }

    fn observe(&mut self, pair: SimilarPair) {
        self.min = self.min.min(pair.similarity);
        // Ties keep the pair with the lower ids so the result is order-independent.
        let stronger = pair.similarity > self.max
            || (pair.similarity == self.max
                && (pair.a, pair.b) < (self.strongest.a, self.strongest.b));
        if stronger {
            self.max = pair.similarity;
            self.strongest = pair;
        }
    }
}

/// The higher-resolution image of a pair; equal or unknown sizes pick the lower id.
pub fn preferred_of(pair: &SimilarPair, pixels: &HashMap<Uuid, i64>) -> Uuid {
    let pa = pixels.get(&pair.a).copied().unwrap_or(0);
    let pb = pixels.get(&pair.b).copied().unwrap_or(0);
    if pb > pa {
        pair.b
    } else {
        pair.a
    }
}

/// Group pairs into clusters of transitively connected images.
///
/// A~B and B~C put A, B and C in one cluster even when A and C were never
/// compared. Clusters are ordered by their smallest member.
pub fn cluster_pairs(pairs: &[SimilarPair], dims: &[ImageDims]) -> Vec<DuplicateCluster> {
    if pairs.is_empty() {
        return Vec::new();
    }

    let pixels: HashMap<Uuid, i64> = dims.iter().map(|d| (d.id, d.pixels())).collect();

    let mut uf = UnionFind::with_capacity(pairs.len() * 2);
    for pair in pairs {
        uf.union(pair.a, pair.b);
    }

    let mut stats: HashMap<Uuid, ClusterStats> = HashMap::new();
    for pair in pairs {
        let Some(root) = uf.root_of(pair.a) else {
            continue;
        };
        stats
            .entry(root)
            .and_modify(|s| s.observe(*pair))
            .or_insert_with(|| ClusterStats::new(*pair));
    }

    uf.components()
        .into_iter()
        .filter_map(|members| {
            let root = uf.root_of(members[0])?;
            let s = stats.get(&root)?;
            Some(DuplicateCluster {
                preferred: preferred_of(&s.strongest, &pixels),
                min_similarity: s.min,
                max_similarity: s.max,
                members,
            })
        })
        .collect()
}
