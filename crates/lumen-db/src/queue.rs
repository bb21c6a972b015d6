//! Queue repository implementation.
//!
//! Claims follow the job queue pattern of `FOR UPDATE SKIP LOCKED` inside a
//! single `UPDATE ... RETURNING`, so two workers polling the same kind never
//! receive the same row. Every claim also writes a lease; an expired lease is
//! swept back to pending by [`QueueRepository::release_expired_leases`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lumen_core::defaults::QUEUE_MAX_RETRIES;
use lumen_core::{
    new_v7, ClaimRequest, CompletionOutcome, EnrichmentKind, Error, QueueItem, QueueItemStatus,
    QueueRepository, QueueStats, Result,
};

const ITEM_COLUMNS: &str = "id, image_id, kind::text, priority, status::text, queued_at, started_at,
     completed_at, error_message, retry_count, max_retries, queued_by, lease_owner, leased_until";

/// Error text recorded when a lease runs out before the worker reports back.
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired";

/// PostgreSQL implementation of QueueRepository.
pub struct PgQueueRepository {
    pool: Pool<Postgres>,
}

impl PgQueueRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_item_row(row: &PgRow) -> Result<QueueItem> {
        Ok(QueueItem {
            id: row.get("id"),
            image_id: row.get("image_id"),
            kind: row.get::<String, _>("kind").parse()?,
            priority: row.get("priority"),
            status: row.get::<String, _>("status").parse()?,
            queued_at: row.get("queued_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error_message: row.get("error_message"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            queued_by: row.get("queued_by"),
            lease_owner: row.get("lease_owner"),
            leased_until: row.get("leased_until"),
        })
    }

    /// Explain why a conditional transition matched no row.
    async fn transition_error(&self, item_id: Uuid, to: &str) -> Error {
        let status: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status::text FROM queue_item WHERE id = $1")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await;
        match status {
            Ok(Some(from)) => Error::InvalidTransition {
                item_id,
                from,
                to: to.to_string(),
            },
            Ok(None) => Error::QueueItemNotFound(item_id),
            Err(e) => Error::Database(e),
        }
    }
}

#[async_trait]
impl QueueRepository for PgQueueRepository {
    async fn enqueue(
        &self,
        kind: EnrichmentKind,
        image_ids: &[Uuid],
        priority: i32,
        queued_by: &str,
    ) -> Result<u64> {
        if image_ids.is_empty() {
            return Ok(0);
        }
        let item_ids: Vec<Uuid> = image_ids.iter().map(|_| new_v7()).collect();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let queued: Vec<Uuid> = sqlx::query_scalar(
            "INSERT INTO queue_item (id, image_id, kind, priority, status, queued_at,
                                     max_retries, queued_by)
             SELECT v.id, v.image_id, $3::enrichment_kind, $4, 'pending'::queue_status, $5, $6, $7
             FROM UNNEST($1::uuid[], $2::uuid[]) AS v(id, image_id)
             WHERE EXISTS (SELECT 1 FROM image i WHERE i.id = v.image_id)
             ON CONFLICT DO NOTHING
             RETURNING image_id",
        )
        .bind(&item_ids)
        .bind(image_ids)
        .bind(kind.as_str())
        .bind(priority)
        .bind(Utc::now())
        .bind(QUEUE_MAX_RETRIES)
        .bind(queued_by)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        // Explicitly queued work is pending work; keep the flag in step.
        let query = format!(
            "UPDATE image SET {col} = 'pending'::task_state WHERE id = ANY($1)",
            col = kind.state_column()
        );
        sqlx::query(&query)
            .bind(&queued)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(queued.len() as u64)
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<QueueItem>> {
        if request.size <= 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let query = format!(
            "UPDATE queue_item
             SET status = 'processing'::queue_status, started_at = $1,
                 lease_owner = $2, leased_until = $3
             WHERE id IN (
                 SELECT id FROM queue_item
                 WHERE kind = $4::enrichment_kind AND status = 'pending'::queue_status
                 ORDER BY priority DESC, queued_at ASC
                 LIMIT $5
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {ITEM_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(&request.owner)
            .bind(now + request.lease)
            .bind(request.kind.as_str())
            .bind(request.size)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut items = rows
            .iter()
            .map(Self::parse_item_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.queued_at.cmp(&b.queued_at))
        });

        debug!(
            subsystem = "queue",
            component = "claim",
            op = "claim_batch",
            kind = %request.kind,
            owner = %request.owner,
            requested = request.size,
            affected = items.len(),
            "Claimed queue items"
        );
        Ok(items)
    }

    async fn complete(&self, item_id: Uuid) -> Result<CompletionOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row: Option<(Uuid, String)> = sqlx::query_as(
            "UPDATE queue_item
             SET status = 'completed'::queue_status, completed_at = $2,
                 lease_owner = NULL, leased_until = NULL
             WHERE id = $1 AND status = 'processing'::queue_status
             RETURNING image_id, kind::text",
        )
        .bind(item_id)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some((image_id, kind)) = row else {
            drop(tx);
            return match self.transition_error(item_id, "completed").await {
                Error::InvalidTransition { from, .. } if from == "completed" => {
                    Ok(CompletionOutcome::AlreadyCompleted)
                }
                e => Err(e),
            };
        };

        let kind: EnrichmentKind = kind.parse()?;
        let query = format!(
            "UPDATE image SET {col} = 'completed'::task_state WHERE id = $1",
            col = kind.state_column()
        );
        sqlx::query(&query)
            .bind(image_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(CompletionOutcome::Completed)
    }

    async fn fail(&self, item_id: Uuid, message: &str) -> Result<QueueItem> {
        let query = format!(
            "UPDATE queue_item
             SET status = 'failed'::queue_status, completed_at = $3, error_message = $2,
                 retry_count = retry_count + 1, lease_owner = NULL, leased_until = NULL
             WHERE id = $1 AND status = 'processing'::queue_status
             RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(item_id)
            .bind(message)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let item = Self::parse_item_row(&row)?;
                if item.is_permanently_failed() {
                    warn!(
                        subsystem = "queue",
                        component = "lifecycle",
                        op = "fail",
                        item_id = %item.id,
                        image_id = %item.image_id,
                        kind = %item.kind,
                        retry_count = item.retry_count,
                        error = message,
                        "Queue item permanently failed"
                    );
                }
                Ok(item)
            }
            None => Err(self.transition_error(item_id, "failed").await),
        }
    }

    async fn retry_failed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        // Only one failed row per (image, kind) may return, and only when no
        // active row exists, otherwise the partial unique index rejects it.
        let result = sqlx::query(
            "UPDATE queue_item
             SET status = 'pending'::queue_status, started_at = NULL, completed_at = NULL,
                 error_message = NULL, lease_owner = NULL, leased_until = NULL
             WHERE id IN (
                 SELECT DISTINCT ON (f.image_id, f.kind) f.id
                 FROM queue_item f
                 WHERE f.status = 'failed'::queue_status
                   AND f.retry_count < f.max_retries
                   AND ($1::text IS NULL OR f.kind::text = $1)
                   AND NOT EXISTS (
                       SELECT 1 FROM queue_item a
                       WHERE a.image_id = f.image_id AND a.kind = f.kind
                         AND a.status IN ('pending'::queue_status, 'processing'::queue_status)
                   )
                 ORDER BY f.image_id, f.kind, f.queued_at DESC
             )",
        )
        .bind(kind.map(|k| k.as_str()))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "queue",
            component = "lifecycle",
            op = "retry_failed",
            affected = result.rows_affected(),
            "Requeued failed items"
        );
        Ok(result.rows_affected())
    }

    async fn clear_completed(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_item
             WHERE status IN ('completed'::queue_status, 'failed'::queue_status)
               AND ($1::text IS NULL OR kind::text = $1)",
        )
        .bind(kind.map(|k| k.as_str()))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self, kind: Option<EnrichmentKind>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_item WHERE ($1::text IS NULL OR kind::text = $1)")
            .bind(kind.map(|k| k.as_str()))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        warn!(
            subsystem = "queue",
            component = "lifecycle",
            op = "clear_all",
            affected = result.rows_affected(),
            "Cleared queue"
        );
        Ok(result.rows_affected())
    }

    async fn release_expired_leases(&self) -> Result<u64> {
        // SET expressions see the old retry_count.
        let result = sqlx::query(
            "UPDATE queue_item
             SET status = CASE WHEN retry_count + 1 < max_retries
                               THEN 'pending'::queue_status
                               ELSE 'failed'::queue_status END,
                 retry_count = retry_count + 1,
                 error_message = $2,
                 started_at = NULL,
                 completed_at = CASE WHEN retry_count + 1 < max_retries THEN NULL ELSE $1 END,
                 lease_owner = NULL,
                 leased_until = NULL
             WHERE id IN (
                 SELECT id FROM queue_item
                 WHERE status = 'processing'::queue_status AND leased_until < $1
                 FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(Utc::now())
        .bind(LEASE_EXPIRED_MESSAGE)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() > 0 {
            warn!(
                subsystem = "queue",
                component = "lease",
                op = "release_expired",
                affected = result.rows_affected(),
                "Released expired leases"
            );
        }
        Ok(result.rows_affected())
    }

    async fn get(&self, item_id: Uuid) -> Result<Option<QueueItem>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM queue_item WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_item_row).transpose()
    }

    async fn list(
        &self,
        kind: Option<EnrichmentKind>,
        status: Option<QueueItemStatus>,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        let query = format!(
            "SELECT {ITEM_COLUMNS} FROM queue_item
             WHERE ($1::text IS NULL OR kind::text = $1)
               AND ($2::text IS NULL OR status::text = $2)
             ORDER BY queued_at DESC, id DESC
             LIMIT $3"
        );
        let rows = sqlx::query(&query)
            .bind(kind.map(|k| k.as_str()))
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::parse_item_row).collect()
    }

    async fn stats(&self, kind: EnrichmentKind) -> Result<QueueStats> {
        let (pending, processing, completed, failed, permanently_failed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                     COUNT(*) FILTER (WHERE status = 'pending'::queue_status),
                     COUNT(*) FILTER (WHERE status = 'processing'::queue_status),
                     COUNT(*) FILTER (WHERE status = 'completed'::queue_status),
                     COUNT(*) FILTER (WHERE status = 'failed'::queue_status),
                     COUNT(*) FILTER (WHERE status = 'failed'::queue_status
                                        AND retry_count >= max_retries)
                 FROM queue_item WHERE kind = $1::enrichment_kind",
            )
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
            permanently_failed,
        })
    }
}
