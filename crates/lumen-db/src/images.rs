//! Image and folder repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use lumen_core::{
    new_v7, Error, GenerationParams, Image, ImageRepository, NewImage, RepairReport, Result,
    TaskState, TaskStates, Vector,
};

use crate::dedup::repair_orphans_tx;
use crate::embedding_cache::release_links_tx;

/// Generation parameter columns, in the order [`params_from_row`] reads them.
pub(crate) const PARAM_COLUMNS: &str =
    "prompt, negative_prompt, model, seed, steps, sampler, cfg_scale, width, height";

pub(crate) fn params_from_row(row: &PgRow) -> GenerationParams {
    GenerationParams {
        prompt: row.get("prompt"),
        negative_prompt: row.get("negative_prompt"),
        model: row.get("model"),
        seed: row.get("seed"),
        steps: row.get("steps"),
        sampler: row.get("sampler"),
        cfg_scale: row.get("cfg_scale"),
        width: row.get("width"),
        height: row.get("height"),
    }
}

/// Give `id` vectors of its own.
///
/// Own vectors replace borrowed ones, and every image borrowing from `id`
/// holds a stale copy afterwards, so those borrowers are detached and the
/// next propagation refreshes them. Shared by direct writes and cache links.
pub(crate) async fn write_own_embeddings_tx(
    conn: &mut PgConnection,
    id: Uuid,
    text: Option<Vector>,
    visual: Option<Vector>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE image SET text_embedding = COALESCE($2, text_embedding),
                visual_embedding = COALESCE($3, visual_embedding),
                embedding_source_id = CASE WHEN embedding_source_id = id THEN id ELSE NULL END
         WHERE id = $1",
    )
    .bind(id)
    .bind(text)
    .bind(visual)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?;
    if result.rows_affected() == 0 {
        return Err(Error::ImageNotFound(id));
    }

    let detached = sqlx::query(
        "UPDATE image SET embedding_source_id = NULL
         WHERE embedding_source_id = $1 AND id <> $1",
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(Error::Database)?
    .rows_affected();
    if detached > 0 {
        debug!(
            subsystem = "dedup",
            component = "images",
            op = "detach_borrowers",
            image_id = %id,
            affected = detached,
            "Detached borrowers of re-embedded image"
        );
    }
    Ok(())
}

/// PostgreSQL implementation of ImageRepository.
pub struct PgImageRepository {
    pool: Pool<Postgres>,
}

impl PgImageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_image_row(row: &PgRow) -> Result<Image> {
        let state = |col: &str| -> Result<TaskState> { row.get::<String, _>(col).parse() };
        Ok(Image {
            id: row.get("id"),
            folder_id: row.get("folder_id"),
            filename: row.get("filename"),
            file_size: row.get("file_size"),
            params: params_from_row(row),
            text_embedding: row.get("text_embedding"),
            visual_embedding: row.get("visual_embedding"),
            metadata_fingerprint: row.get("metadata_fingerprint"),
            embedding_source_id: row.get("embedding_source_id"),
            is_embedding_representative: row.get("is_embedding_representative"),
            states: TaskStates {
                tagging: state("tagging_state")?,
                captioning: state("captioning_state")?,
                embedding: state("embedding_state")?,
                face_detection: state("face_detection_state")?,
            },
            created_at: row.get("created_at"),
        })
    }

    async fn insert_one(conn: &mut PgConnection, image: &NewImage) -> Result<Uuid> {
        let id = new_v7();
        let p = &image.params;
        sqlx::query(
            "INSERT INTO image (id, folder_id, filename, file_size, prompt, negative_prompt, model,
                                seed, steps, sampler, cfg_scale, width, height, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(id)
        .bind(image.folder_id)
        .bind(&image.filename)
        .bind(image.file_size)
        .bind(&p.prompt)
        .bind(&p.negative_prompt)
        .bind(&p.model)
        .bind(p.seed)
        .bind(p.steps)
        .bind(&p.sampler)
        .bind(p.cfg_scale)
        .bind(p.width)
        .bind(p.height)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }

    /// Delete images after repairing everything that borrows from them.
    ///
    /// Runs on the caller's transaction so the repair and the deletion
    /// commit together.
    pub(crate) async fn delete_images_tx(
        conn: &mut PgConnection,
        ids: &[Uuid],
    ) -> Result<RepairReport> {
        if ids.is_empty() {
            return Ok(RepairReport::default());
        }

        // Anything referenced from outside the deleted set must be repaired,
        // whether or not it still carries the representative flag.
        let sources: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT embedding_source_id FROM image
             WHERE embedding_source_id = ANY($1) AND NOT (id = ANY($1))",
        )
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;

        let mut report = repair_orphans_tx(&mut *conn, &sources).await?;
        let flagged: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM image WHERE id = ANY($1) AND is_embedding_representative",
        )
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
        for rep in flagged {
            if !report.representatives.contains(&rep) {
                report.representatives.push(rep);
            }
        }
        report.representatives.sort();

        release_links_tx(&mut *conn, ids).await?;

        sqlx::query("DELETE FROM image WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;

        Ok(report)
    }

    async fn folder_exists(&self, folder_id: Uuid) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM folder WHERE id = $1)")
            .bind(folder_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn insert(&self, image: NewImage) -> Result<Uuid> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        Self::insert_one(&mut conn, &image).await
    }

    async fn insert_batch(&self, images: Vec<NewImage>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut ids = Vec::with_capacity(images.len());
        for image in &images {
            ids.push(Self::insert_one(&mut tx, image).await?);
        }
        tx.commit().await.map_err(Error::Database)?;
        debug!(
            subsystem = "catalog",
            component = "images",
            op = "insert_batch",
            affected = ids.len(),
            "Registered image batch"
        );
        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>> {
        let query = format!(
            "SELECT id, folder_id, filename, file_size, {PARAM_COLUMNS},
                    text_embedding, visual_embedding, metadata_fingerprint,
                    embedding_source_id, is_embedding_representative,
                    tagging_state::text, captioning_state::text,
                    embedding_state::text, face_detection_state::text, created_at
             FROM image WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_image_row).transpose()
    }

    async fn update_generation_params(&self, id: Uuid, params: GenerationParams) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // A new parameter set may move the image to another group; whatever
        // it lent or borrowed under the old fingerprint is dropped first.
        let row: Option<(bool, Option<Uuid>)> = sqlx::query_as(
            "SELECT is_embedding_representative, embedding_source_id FROM image
             WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let Some((is_rep, source)) = row else {
            return Err(Error::ImageNotFound(id));
        };
        if is_rep {
            repair_orphans_tx(&mut tx, &[id]).await?;
        } else if matches!(source, Some(src) if src != id) {
            sqlx::query(
                "UPDATE image SET embedding_source_id = NULL, text_embedding = NULL,
                        visual_embedding = NULL, embedding_state = 'never_queued'::task_state
                 WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            "UPDATE image SET prompt = $2, negative_prompt = $3, model = $4, seed = $5, steps = $6,
                    sampler = $7, cfg_scale = $8, width = $9, height = $10,
                    metadata_fingerprint = NULL, is_embedding_representative = FALSE,
                    embedding_source_id = CASE WHEN embedding_source_id = id THEN NULL
                                               ELSE embedding_source_id END
             WHERE id = $1",
        )
        .bind(id)
        .bind(&params.prompt)
        .bind(&params.negative_prompt)
        .bind(&params.model)
        .bind(params.seed)
        .bind(params.steps)
        .bind(&params.sampler)
        .bind(params.cfg_scale)
        .bind(params.width)
        .bind(params.height)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn set_embeddings(
        &self,
        id: Uuid,
        text: Option<Vector>,
        visual: Option<Vector>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        write_own_embeddings_tx(&mut tx, id, text, visual).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_images(&self, ids: &[Uuid]) -> Result<RepairReport> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let report = Self::delete_images_tx(&mut tx, ids).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "catalog",
            component = "images",
            op = "delete",
            requested = ids.len(),
            representatives = report.representatives.len(),
            affected = report.affected_images.len(),
            "Deleted images"
        );
        Ok(report)
    }

    async fn create_folder(&self, parent_id: Option<Uuid>, path: &str) -> Result<Uuid> {
        if let Some(parent) = parent_id {
            if !self.folder_exists(parent).await? {
                return Err(Error::FolderNotFound(parent));
            }
        }
        let id = new_v7();
        sqlx::query("INSERT INTO folder (id, parent_id, path, created_at) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(parent_id)
            .bind(path)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn folder_image_ids(&self, folder_id: Uuid, recursive: bool) -> Result<Vec<Uuid>> {
        if !self.folder_exists(folder_id).await? {
            return Err(Error::FolderNotFound(folder_id));
        }
        let ids = if recursive {
            sqlx::query_scalar(
                "WITH RECURSIVE tree AS (
                     SELECT id FROM folder WHERE id = $1
                     UNION ALL
                     SELECT f.id FROM folder f JOIN tree t ON f.parent_id = t.id
                 )
                 SELECT i.id FROM image i JOIN tree t ON i.folder_id = t.id ORDER BY i.id",
            )
            .bind(folder_id)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_scalar("SELECT id FROM image WHERE folder_id = $1 ORDER BY id")
                .bind(folder_id)
                .fetch_all(&self.pool)
                .await
        };
        ids.map_err(Error::Database)
    }

    async fn delete_folder(&self, folder_id: Uuid) -> Result<RepairReport> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let image_ids: Vec<Uuid> = sqlx::query_scalar(
            "WITH RECURSIVE tree AS (
                 SELECT id FROM folder WHERE id = $1
                 UNION ALL
                 SELECT f.id FROM folder f JOIN tree t ON f.parent_id = t.id
             )
             SELECT i.id FROM image i JOIN tree t ON i.folder_id = t.id",
        )
        .bind(folder_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let report = Self::delete_images_tx(&mut tx, &image_ids).await?;

        // Child folders follow through ON DELETE CASCADE.
        let deleted = sqlx::query("DELETE FROM folder WHERE id = $1")
            .bind(folder_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        if deleted.rows_affected() == 0 {
            return Err(Error::FolderNotFound(folder_id));
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "catalog",
            component = "folders",
            op = "delete",
            folder_id = %folder_id,
            images = image_ids.len(),
            affected = report.affected_images.len(),
            "Deleted folder tree"
        );
        Ok(report)
    }
}
