//! Vector-index access for duplicate detection.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::{
    new_v7, DuplicateCluster, Error, ImageDescriptor, ImageDims, Result, SimilarPair,
    SimilarityRepository,
};

use crate::images::{params_from_row, PARAM_COLUMNS};

/// Keep the strongest observation of each normalized pair.
pub fn dedupe_pairs(pairs: impl IntoIterator<Item = SimilarPair>) -> Vec<SimilarPair> {
    let mut best: HashMap<(Uuid, Uuid), f32> = HashMap::new();
    for pair in pairs {
        best.entry((pair.a, pair.b))
            .and_modify(|s| *s = s.max(pair.similarity))
            .or_insert(pair.similarity);
    }
    let mut out: Vec<SimilarPair> = best
        .into_iter()
        .map(|((a, b), similarity)| SimilarPair { a, b, similarity })
        .collect();
    out.sort_by(|x, y| (x.a, x.b).cmp(&(y.a, y.b)));
    out
}

/// PostgreSQL implementation of SimilarityRepository.
pub struct PgSimilarityRepository {
    pool: Pool<Postgres>,
}

impl PgSimilarityRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SimilarityRepository for PgSimilarityRepository {
    async fn visual_corpus_size(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM image WHERE visual_embedding IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn visual_image_ids(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT id FROM image
             WHERE visual_embedding IS NOT NULL AND ($1::uuid IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn nearest_pairs(
        &self,
        image_ids: &[Uuid],
        neighbours: i64,
        threshold: f32,
        ef_search: u32,
    ) -> Result<Vec<SimilarPair>> {
        if image_ids.is_empty() || neighbours <= 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // SET does not take bind parameters; ef_search is an integer.
        sqlx::query(&format!("SET LOCAL hnsw.ef_search = {ef_search}"))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let rows = sqlx::query(
            "SELECT q.id AS query_id, n.id AS neighbour_id, (1 - n.distance)::real AS similarity
             FROM image q
             CROSS JOIN LATERAL (
                 SELECT c.id, c.visual_embedding <=> q.visual_embedding AS distance
                 FROM image c
                 WHERE c.visual_embedding IS NOT NULL AND c.id <> q.id
                 ORDER BY c.visual_embedding <=> q.visual_embedding
                 LIMIT $2
             ) n
             WHERE q.id = ANY($1) AND q.visual_embedding IS NOT NULL
               AND 1 - n.distance >= $3",
        )
        .bind(image_ids)
        .bind(neighbours)
        .bind(f64::from(threshold))
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        let pairs = dedupe_pairs(rows.iter().filter_map(|row| {
            SimilarPair::new(
                row.get("query_id"),
                row.get("neighbour_id"),
                row.get("similarity"),
            )
        }));

        debug!(
            subsystem = "similarity",
            component = "candidates",
            op = "nearest_pairs",
            requested = image_ids.len(),
            ef_search = ef_search,
            affected = pairs.len(),
            "Generated candidate pairs"
        );
        Ok(pairs)
    }

    async fn dimensions(&self, ids: &[Uuid]) -> Result<Vec<ImageDims>> {
        let rows: Vec<(Uuid, Option<i32>, Option<i32>)> =
            sqlx::query_as("SELECT id, width, height FROM image WHERE id = ANY($1) ORDER BY id")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(rows
            .into_iter()
            .map(|(id, width, height)| ImageDims { id, width, height })
            .collect())
    }

    async fn variant_candidates(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ImageDescriptor>> {
        let query = format!(
            "SELECT id, filename, file_size, {PARAM_COLUMNS} FROM image
             WHERE seed IS NOT NULL AND model IS NOT NULL
               AND ($1::uuid IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows
            .iter()
            .map(|row| ImageDescriptor {
                id: row.get("id"),
                filename: row.get("filename"),
                file_size: row.get("file_size"),
                params: params_from_row(row),
            })
            .collect())
    }

    async fn materialize_clusters(&self, clusters: &[DuplicateCluster]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM duplicate_cluster")
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let now = Utc::now();
        for cluster in clusters {
            let id = new_v7();
            sqlx::query(
                "INSERT INTO duplicate_cluster (id, preferred_image_id, min_similarity,
                                                max_similarity, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(cluster.preferred)
            .bind(cluster.min_similarity)
            .bind(cluster.max_similarity)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            sqlx::query(
                "INSERT INTO duplicate_cluster_member (cluster_id, image_id)
                 SELECT $1, m FROM UNNEST($2::uuid[]) AS m",
            )
            .bind(id)
            .bind(&cluster.members)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "similarity",
            component = "clusters",
            op = "materialize",
            group_count = clusters.len(),
            "Materialized duplicate clusters"
        );
        Ok(clusters.len() as u64)
    }

    async fn materialized_clusters(&self) -> Result<Vec<DuplicateCluster>> {
        let rows = sqlx::query(
            "SELECT c.preferred_image_id, c.min_similarity, c.max_similarity,
                    array_agg(m.image_id ORDER BY m.image_id) AS members
             FROM duplicate_cluster c
             JOIN duplicate_cluster_member m ON m.cluster_id = c.id
             GROUP BY c.id
             ORDER BY c.created_at, c.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .iter()
            .map(|row| DuplicateCluster {
                members: row.get("members"),
                preferred: row.get("preferred_image_id"),
                min_similarity: row.get("min_similarity"),
                max_similarity: row.get("max_similarity"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_pairs_keeps_strongest() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let pairs = vec![
            SimilarPair::new(a, b, 0.96).unwrap(),
            SimilarPair::new(b, a, 0.97).unwrap(),
        ];
        let out = dedupe_pairs(pairs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].a, a);
        assert!((out[0].similarity - 0.97).abs() < f32::EPSILON);
    }
}
