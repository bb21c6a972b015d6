//! Worker lifecycle repository implementation.
//!
//! One row per kind, created on first use. Each statement is an upsert that
//! writes only the columns its operation owns, so a counter bump and a pause
//! issued at the same moment both survive.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::info;

use lumen_core::{EnrichmentKind, Error, Result, WorkerState, WorkerStateRepository, WorkerStatus};

const STATE_COLUMNS: &str = "kind::text, status::text, processed_count, failed_count, last_error,
     last_error_at, started_at, paused_at, stopped_at, updated_at";

/// PostgreSQL implementation of WorkerStateRepository.
pub struct PgWorkerStateRepository {
    pool: Pool<Postgres>,
}

impl PgWorkerStateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_state_row(row: &PgRow) -> Result<WorkerState> {
        Ok(WorkerState {
            kind: row.get::<String, _>("kind").parse()?,
            status: row.get::<String, _>("status").parse()?,
            processed_count: row.get("processed_count"),
            failed_count: row.get("failed_count"),
            last_error: row.get("last_error"),
            last_error_at: row.get("last_error_at"),
            started_at: row.get("started_at"),
            paused_at: row.get("paused_at"),
            stopped_at: row.get("stopped_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl WorkerStateRepository for PgWorkerStateRepository {
    async fn get(&self, kind: EnrichmentKind) -> Result<WorkerState> {
        // The no-op DO UPDATE makes RETURNING yield the existing row.
        let query = format!(
            "INSERT INTO worker_state (kind, updated_at) VALUES ($1::enrichment_kind, $2)
             ON CONFLICT (kind) DO UPDATE SET kind = EXCLUDED.kind
             RETURNING {STATE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(kind.as_str())
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Self::parse_state_row(&row)
    }

    async fn set_status(
        &self,
        kind: EnrichmentKind,
        status: WorkerStatus,
    ) -> Result<WorkerState> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO worker_state (kind, status, started_at, paused_at, stopped_at, updated_at)
             VALUES ($1::enrichment_kind, $2::worker_status,
                     CASE WHEN $2 = 'running' THEN $3 END,
                     CASE WHEN $2 = 'paused' THEN $3 END,
                     CASE WHEN $2 = 'stopped' THEN $3 END,
                     $3)
             ON CONFLICT (kind) DO UPDATE SET
                 status = EXCLUDED.status,
                 started_at = COALESCE(EXCLUDED.started_at, worker_state.started_at),
                 paused_at = COALESCE(EXCLUDED.paused_at, worker_state.paused_at),
                 stopped_at = COALESCE(EXCLUDED.stopped_at, worker_state.stopped_at),
                 updated_at = EXCLUDED.updated_at
             RETURNING {STATE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(kind.as_str())
            .bind(status.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        info!(
            subsystem = "queue",
            component = "worker_state",
            op = "set_status",
            kind = %kind,
            status = %status,
            "Worker status changed"
        );
        Self::parse_state_row(&row)
    }

    async fn increment_counters(
        &self,
        kind: EnrichmentKind,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        if processed == 0 && failed == 0 {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO worker_state (kind, processed_count, failed_count, updated_at)
             VALUES ($1::enrichment_kind, $2, $3, $4)
             ON CONFLICT (kind) DO UPDATE SET
                 processed_count = worker_state.processed_count + EXCLUDED.processed_count,
                 failed_count = worker_state.failed_count + EXCLUDED.failed_count,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(kind.as_str())
        .bind(processed)
        .bind(failed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn record_error(&self, kind: EnrichmentKind, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_state (kind, last_error, last_error_at, updated_at)
             VALUES ($1::enrichment_kind, $2, $3, $3)
             ON CONFLICT (kind) DO UPDATE SET
                 last_error = EXCLUDED.last_error,
                 last_error_at = EXCLUDED.last_error_at,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn reset_counters(&self, kind: EnrichmentKind) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_state (kind, updated_at) VALUES ($1::enrichment_kind, $2)
             ON CONFLICT (kind) DO UPDATE SET
                 processed_count = 0,
                 failed_count = 0,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(kind.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "queue",
            component = "worker_state",
            op = "reset_counters",
            kind = %kind,
            "Worker counters reset"
        );
        Ok(())
    }
}
