//! Task state repository implementation.
//!
//! Flag columns are chosen from [`EnrichmentKind::state_column`], a closed
//! set of static names, so interpolating them into SQL is safe.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use lumen_core::{
    new_v7, reopens_completed, EnrichmentKind, Error, Result, TaskState, TaskStateCounts,
    TaskStateRepository,
};

/// PostgreSQL implementation of TaskStateRepository.
pub struct PgTaskStateRepository {
    pool: Pool<Postgres>,
}

impl PgTaskStateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStateRepository for PgTaskStateRepository {
    async fn set_state(
        &self,
        kind: EnrichmentKind,
        ids: &[Uuid],
        state: TaskState,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let col = kind.state_column();
        let query = format!(
            "UPDATE image SET {col} = $2::task_state
             WHERE id = ANY($1) AND {col} <> $2::task_state"
        );
        let result = sqlx::query(&query)
            .bind(ids)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn smart_queue(
        &self,
        kind: EnrichmentKind,
        ids: &[Uuid],
        skip_already_processed: bool,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let col = kind.state_column();
        // One set-based statement; concurrent callers serialize on the row
        // locks and the second one sees the first one's result.
        let query = format!(
            "UPDATE image SET {col} = 'pending'::task_state
             WHERE id = ANY($1)
               AND ({col} = 'never_queued'::task_state
                    OR ($2 AND {col} = 'completed'::task_state))"
        );
        let result = sqlx::query(&query)
            .bind(ids)
            .bind(reopens_completed(kind, skip_already_processed))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn clear_pending(&self, kind: EnrichmentKind) -> Result<u64> {
        let col = kind.state_column();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let query = format!(
            "UPDATE image SET {col} = 'never_queued'::task_state
             WHERE {col} = 'pending'::task_state"
        );
        let flags = sqlx::query(&query)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        let rows = sqlx::query(
            "DELETE FROM queue_item
             WHERE kind = $1::enrichment_kind AND status = 'pending'::queue_status",
        )
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "tracker",
            component = "task_state",
            op = "clear_pending",
            kind = %kind,
            affected = flags,
            queue_rows = rows,
            "Cleared pending flags"
        );
        Ok(flags)
    }

    async fn enqueue_flagged(
        &self,
        kind: EnrichmentKind,
        priority: i32,
        queued_by: &str,
        limit: i64,
    ) -> Result<u64> {
        let col = kind.state_column();
        // A permanently failed row keeps its image out of the queue until an
        // operator clears it; a fresh row would reset the retry budget.
        let query = format!(
            "SELECT i.id FROM image i
             WHERE i.{col} = 'pending'::task_state
               AND NOT EXISTS (
                   SELECT 1 FROM queue_item q
                   WHERE q.image_id = i.id AND q.kind = $1::enrichment_kind
                     AND (q.status IN ('pending'::queue_status, 'processing'::queue_status)
                          OR (q.status = 'failed'::queue_status
                              AND q.retry_count >= q.max_retries))
               )
             ORDER BY i.id
             LIMIT $2"
        );
        let image_ids: Vec<Uuid> = sqlx::query_scalar(&query)
            .bind(kind.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        if image_ids.is_empty() {
            return Ok(0);
        }

        let item_ids: Vec<Uuid> = image_ids.iter().map(|_| new_v7()).collect();
        // A concurrent producer may have queued some of these already; the
        // partial unique index turns those into no-ops.
        let result = sqlx::query(
            "INSERT INTO queue_item (id, image_id, kind, priority, status, queued_at,
                                     max_retries, queued_by)
             SELECT v.id, v.image_id, $3::enrichment_kind, $4, 'pending'::queue_status, $5, $6, $7
             FROM UNNEST($1::uuid[], $2::uuid[]) AS v(id, image_id)
             ON CONFLICT DO NOTHING",
        )
        .bind(&item_ids)
        .bind(&image_ids)
        .bind(kind.as_str())
        .bind(priority)
        .bind(Utc::now())
        .bind(lumen_core::defaults::QUEUE_MAX_RETRIES)
        .bind(queued_by)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn counts(&self, kind: EnrichmentKind) -> Result<TaskStateCounts> {
        let col = kind.state_column();
        let query = format!(
            "SELECT COUNT(*) FILTER (WHERE {col} = 'never_queued'::task_state),
                    COUNT(*) FILTER (WHERE {col} = 'pending'::task_state),
                    COUNT(*) FILTER (WHERE {col} = 'completed'::task_state)
             FROM image"
        );
        let (never_queued, pending, completed): (i64, i64, i64) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(TaskStateCounts {
            never_queued,
            pending,
            completed,
        })
    }
}
