//! Fingerprint, representative and propagation repository implementation.

use async_trait::async_trait;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::{
    DedupRepository, Error, FingerprintGroup, FingerprintSource, GroupMember, PropagationOutcome,
    RepairReport, Result,
};

use crate::images::{params_from_row, PARAM_COLUMNS};

/// Clear every reference to `representatives` on the caller's connection.
///
/// Borrowers lose their source, their propagated vectors and their
/// representative flag, and their embedding state returns to
/// `never_queued`. The representatives themselves lose the flag. Shared by
/// deletion paths so the repair commits with the delete.
pub(crate) async fn repair_orphans_tx(
    conn: &mut PgConnection,
    representatives: &[Uuid],
) -> Result<RepairReport> {
    if representatives.is_empty() {
        return Ok(RepairReport::default());
    }

    let mut affected: Vec<Uuid> = sqlx::query_scalar(
        "UPDATE image SET embedding_source_id = NULL, text_embedding = NULL,
                visual_embedding = NULL, is_embedding_representative = FALSE,
                embedding_state = 'never_queued'::task_state
         WHERE embedding_source_id = ANY($1) AND NOT (id = ANY($1))
         RETURNING id",
    )
    .bind(representatives)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;
    affected.sort();

    sqlx::query(
        "UPDATE image SET is_embedding_representative = FALSE, embedding_source_id = NULL
         WHERE id = ANY($1)",
    )
    .bind(representatives)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let mut reps = representatives.to_vec();
    reps.sort();
    reps.dedup();
    Ok(RepairReport {
        representatives: reps,
        affected_images: affected,
    })
}

/// PostgreSQL implementation of DedupRepository.
pub struct PgDedupRepository {
    pool: Pool<Postgres>,
}

impl PgDedupRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupRepository for PgDedupRepository {
    async fn images_missing_fingerprint(&self, limit: i64) -> Result<Vec<FingerprintSource>> {
        let query = format!(
            "SELECT id, {PARAM_COLUMNS} FROM image
             WHERE metadata_fingerprint IS NULL
               AND (prompt IS NOT NULL OR model IS NOT NULL OR seed IS NOT NULL)
             ORDER BY id
             LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows
            .iter()
            .map(|row| FingerprintSource {
                id: row.get("id"),
                params: params_from_row(row),
            })
            .collect())
    }

    async fn set_fingerprints(&self, values: &[(Uuid, String)]) -> Result<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let (ids, fingerprints): (Vec<Uuid>, Vec<String>) = values.iter().cloned().unzip();
        let result = sqlx::query(
            "UPDATE image i SET metadata_fingerprint = v.fingerprint
             FROM UNNEST($1::uuid[], $2::text[]) AS v(id, fingerprint)
             WHERE i.id = v.id",
        )
        .bind(&ids)
        .bind(&fingerprints)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn fingerprint_groups(
        &self,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FingerprintGroup>> {
        let rows = sqlx::query(
            "SELECT metadata_fingerprint,
                    array_agg(id ORDER BY id) AS ids,
                    array_agg(file_size ORDER BY id) AS sizes
             FROM image
             WHERE metadata_fingerprint IS NOT NULL
               AND ($1::text IS NULL OR metadata_fingerprint > $1)
             GROUP BY metadata_fingerprint
             HAVING COUNT(*) >= 2
             ORDER BY metadata_fingerprint
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .iter()
            .map(|row| {
                let ids: Vec<Uuid> = row.get("ids");
                let sizes: Vec<i64> = row.get("sizes");
                FingerprintGroup {
                    fingerprint: row.get("metadata_fingerprint"),
                    members: ids
                        .into_iter()
                        .zip(sizes)
                        .map(|(id, file_size)| GroupMember { id, file_size })
                        .collect(),
                }
            })
            .collect())
    }

    async fn mark_representative(&self, fingerprint: &str, representative: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Former representatives keep the vectors they computed but stop
        // lending; their borrowers keep their copies and are re-pointed by
        // the next propagation.
        let demoted: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE image SET is_embedding_representative = FALSE, embedding_source_id = NULL
             WHERE metadata_fingerprint = $1 AND is_embedding_representative AND id <> $2
             RETURNING id",
        )
        .bind(fingerprint)
        .bind(representative)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let detached = if demoted.is_empty() {
            0
        } else {
            sqlx::query("UPDATE image SET embedding_source_id = NULL WHERE embedding_source_id = ANY($1)")
                .bind(&demoted)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?
                .rows_affected()
        };

        let promoted = sqlx::query(
            "UPDATE image SET is_embedding_representative = TRUE, embedding_source_id = id
             WHERE id = $1 AND metadata_fingerprint = $2
               AND (NOT is_embedding_representative OR embedding_source_id IS DISTINCT FROM id)",
        )
        .bind(representative)
        .bind(fingerprint)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        let changed = !demoted.is_empty() || detached > 0 || promoted > 0;
        if changed {
            debug!(
                subsystem = "dedup",
                component = "election",
                op = "mark_representative",
                image_id = %representative,
                demoted = demoted.len(),
                "Representative elected"
            );
        }
        Ok(changed)
    }

    async fn representatives(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT id FROM image
             WHERE is_embedding_representative AND ($1::uuid IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn propagate_from(&self, representative: Uuid) -> Result<PropagationOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let rep: Option<(Option<String>, bool)> = sqlx::query_as(
            "SELECT metadata_fingerprint,
                    (text_embedding IS NOT NULL OR visual_embedding IS NOT NULL)
             FROM image
             WHERE id = $1 AND is_embedding_representative
             FOR SHARE",
        )
        .bind(representative)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        match rep {
            None | Some((None, _)) => return Ok(PropagationOutcome::NotRepresentative),
            Some((Some(_), false)) => return Ok(PropagationOutcome::NoVectors),
            Some((Some(_), true)) => {}
        }

        let updated: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE image m
             SET text_embedding = r.text_embedding,
                 visual_embedding = r.visual_embedding,
                 embedding_source_id = r.id,
                 is_embedding_representative = FALSE,
                 embedding_state = 'completed'::task_state
             FROM image r
             WHERE r.id = $1
               AND m.metadata_fingerprint = r.metadata_fingerprint
               AND m.id <> r.id
               AND m.embedding_source_id IS DISTINCT FROM r.id
             RETURNING m.id",
        )
        .bind(representative)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if !updated.is_empty() {
            // Borrowed work no longer needs a GPU slot.
            sqlx::query(
                "DELETE FROM queue_item
                 WHERE image_id = ANY($1) AND kind = 'embedding'::enrichment_kind
                   AND status = 'pending'::queue_status",
            )
            .bind(&updated)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(PropagationOutcome::Propagated(updated.len() as u64))
    }

    async fn repair_orphans(&self, representatives: &[Uuid]) -> Result<RepairReport> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let report = repair_orphans_tx(&mut tx, representatives).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "dedup",
            component = "repair",
            op = "repair_orphans",
            requested = representatives.len(),
            affected = report.affected_images.len(),
            "Repaired orphaned embedding references"
        );
        Ok(report)
    }

    async fn dangling_references(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT i.id FROM image i
             LEFT JOIN image s ON s.id = i.embedding_source_id
             WHERE i.embedding_source_id IS NOT NULL
               AND i.embedding_source_id <> i.id
               AND (s.id IS NULL OR NOT s.is_embedding_representative)
             ORDER BY i.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn dangling_sources(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT DISTINCT i.embedding_source_id FROM image i
             LEFT JOIN image s ON s.id = i.embedding_source_id
             WHERE i.embedding_source_id IS NOT NULL
               AND i.embedding_source_id <> i.id
               AND (s.id IS NULL OR NOT s.is_embedding_representative)
             ORDER BY i.embedding_source_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }
}
