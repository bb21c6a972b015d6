//! Content-addressed embedding cache repository implementation.
//!
//! Entries are keyed by `(content_hash, content_kind)` and reference-counted
//! through `image_cache_link`, one link per image and content kind. Mirrors
//! the blob deduplication scheme of file storage: the count moves in the same
//! transaction as the link, and only unreferenced entries are ever pruned.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::{
    CacheContentKind, CacheLookup, EmbeddingCacheEntry, EmbeddingCacheRepository, Error, Result,
    Vector,
};

use crate::images::write_own_embeddings_tx;

const ENTRY_COLUMNS: &str = "content_hash, content_kind, vector, ref_count, last_used_at, created_at";

fn parse_entry_row(row: &PgRow) -> Result<EmbeddingCacheEntry> {
    Ok(EmbeddingCacheEntry {
        content_hash: row.get("content_hash"),
        content_kind: row.get::<String, _>("content_kind").parse()?,
        vector: row.get("vector"),
        ref_count: row.get("ref_count"),
        last_used_at: row.get("last_used_at"),
        created_at: row.get("created_at"),
    })
}

/// Drop every cache link held by `image_ids`, decrementing the entries they
/// pointed at. Returns the number of links removed.
pub(crate) async fn release_links_tx(conn: &mut PgConnection, image_ids: &[Uuid]) -> Result<u64> {
    if image_ids.is_empty() {
        return Ok(0);
    }
    sqlx::query(
        "UPDATE embedding_cache c SET ref_count = GREATEST(c.ref_count - l.links, 0)
         FROM (
             SELECT content_hash, content_kind, COUNT(*)::int AS links
             FROM image_cache_link
             WHERE image_id = ANY($1)
             GROUP BY content_hash, content_kind
         ) l
         WHERE c.content_hash = l.content_hash AND c.content_kind = l.content_kind",
    )
    .bind(image_ids)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;

    let removed = sqlx::query("DELETE FROM image_cache_link WHERE image_id = ANY($1)")
        .bind(image_ids)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?
        .rows_affected();
    Ok(removed)
}

/// PostgreSQL implementation of EmbeddingCacheRepository.
pub struct PgEmbeddingCacheRepository {
    pool: Pool<Postgres>,
}

impl PgEmbeddingCacheRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Point the image's link for `kind` at `hash`, moving the reference
    /// count, then copy the entry's vector onto the image as its own.
    async fn link_tx(
        conn: &mut PgConnection,
        image_id: Uuid,
        kind: CacheContentKind,
        hash: &str,
    ) -> Result<EmbeddingCacheEntry> {
        let now = Utc::now();
        let previous: Option<String> = sqlx::query_scalar(
            "SELECT content_hash FROM image_cache_link
             WHERE image_id = $1 AND content_kind = $2
             FOR UPDATE",
        )
        .bind(image_id)
        .bind(kind.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;

        let already_linked = previous.as_deref() == Some(hash);
        if let Some(old) = previous.as_deref().filter(|old| *old != hash) {
            sqlx::query(
                "UPDATE embedding_cache SET ref_count = GREATEST(ref_count - 1, 0)
                 WHERE content_hash = $1 AND content_kind = $2",
            )
            .bind(old)
            .bind(kind.as_str())
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        }

        if !already_linked {
            sqlx::query(
                "INSERT INTO image_cache_link (image_id, content_kind, content_hash)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (image_id, content_kind) DO UPDATE SET content_hash = EXCLUDED.content_hash",
            )
            .bind(image_id)
            .bind(kind.as_str())
            .bind(hash)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        }

        let query = format!(
            "UPDATE embedding_cache
             SET ref_count = ref_count + $3, last_used_at = $4
             WHERE content_hash = $1 AND content_kind = $2
             RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(hash)
            .bind(kind.as_str())
            .bind(if already_linked { 0_i32 } else { 1_i32 })
            .bind(now)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::Database)?;
        let entry = parse_entry_row(&row)?;

        let (text, visual) = match kind {
            CacheContentKind::Text => (Some(entry.vector.clone()), None),
            CacheContentKind::Pixels => (None, Some(entry.vector.clone())),
        };
        write_own_embeddings_tx(conn, image_id, text, visual).await?;
        Ok(entry)
    }
}

#[async_trait]
impl EmbeddingCacheRepository for PgEmbeddingCacheRepository {
    async fn lookup_and_link(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
    ) -> Result<CacheLookup> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let locked: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM embedding_cache
             WHERE content_hash = $1 AND content_kind = $2
             FOR UPDATE",
        )
        .bind(content_hash)
        .bind(kind.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if locked.is_none() {
            return Ok(CacheLookup::Miss);
        }

        let entry = Self::link_tx(&mut tx, image_id, kind, content_hash).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "dedup",
            component = "embedding_cache",
            op = "hit",
            image_id = %image_id,
            content_kind = kind.as_str(),
            ref_count = entry.ref_count,
            "Embedding cache hit"
        );
        Ok(CacheLookup::Hit(entry))
    }

    async fn store(
        &self,
        image_id: Uuid,
        kind: CacheContentKind,
        content_hash: &str,
        vector: Vector,
    ) -> Result<EmbeddingCacheEntry> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let now = Utc::now();

        // A concurrent store of identical content wins the insert; both
        // images then share its vector.
        sqlx::query(
            "INSERT INTO embedding_cache (content_hash, content_kind, vector, ref_count,
                                          last_used_at, created_at)
             VALUES ($1, $2, $3, 0, $4, $4)
             ON CONFLICT (content_hash, content_kind) DO NOTHING",
        )
        .bind(content_hash)
        .bind(kind.as_str())
        .bind(&vector)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let entry = Self::link_tx(&mut tx, image_id, kind, content_hash).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(entry)
    }

    async fn release(&self, image_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let removed = release_links_tx(&mut tx, &[image_id]).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(removed)
    }

    async fn get(
        &self,
        kind: CacheContentKind,
        content_hash: &str,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM embedding_cache
             WHERE content_hash = $1 AND content_kind = $2"
        );
        let row = sqlx::query(&query)
            .bind(content_hash)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(parse_entry_row).transpose()
    }

    async fn prune_unreferenced(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM embedding_cache c
             WHERE c.ref_count = 0 AND c.last_used_at < $1
               AND NOT EXISTS (
                   SELECT 1 FROM image_cache_link l
                   WHERE l.content_hash = c.content_hash AND l.content_kind = c.content_kind
               )",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "dedup",
            component = "embedding_cache",
            op = "prune",
            affected = result.rows_affected(),
            "Pruned unreferenced cache entries"
        );
        Ok(result.rows_affected())
    }
}
