//! Catalog-facing registration and deletion.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use lumen_core::defaults::REGISTER_CHUNK_SIZE;
use lumen_core::{Error, ImageRepository, NewImage, RepairReport, Result};
use lumen_db::Repositories;

/// Outcome of a bulk registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterReport {
    /// Ids in input order, for the chunks that were stored.
    pub registered: Vec<Uuid>,
    /// Images never stored because the operation was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

/// Registers scanned images and removes deleted ones.
#[derive(Clone)]
pub struct Catalog {
    images: Arc<dyn ImageRepository>,
    chunk_size: usize,
}

impl Catalog {
    pub fn new(images: Arc<dyn ImageRepository>) -> Self {
        Self {
            images,
            chunk_size: REGISTER_CHUNK_SIZE,
        }
    }

    pub fn from_repositories(repos: &Repositories) -> Self {
        Self::new(repos.images.clone())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Insert images in chunks, checking `cancel` between chunks.
    ///
    /// Every chunk is atomic; a cancelled run keeps the chunks already stored.
    pub async fn register_images(
        &self,
        images: Vec<NewImage>,
        cancel: &CancellationToken,
    ) -> Result<RegisterReport> {
        if let Some(bad) = images.iter().find(|i| i.filename.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "image filename must not be empty (file_size {})",
                bad.file_size
            )));
        }

        let total = images.len();
        let mut report = RegisterReport::default();
        let mut remaining = images.into_iter().peekable();
        while remaining.peek().is_some() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let chunk: Vec<NewImage> = remaining.by_ref().take(self.chunk_size).collect();
            let ids = self.images.insert_batch(chunk).await?;
            report.registered.extend(ids);
        }
        report.skipped = total - report.registered.len();

        info!(
            subsystem = "jobs",
            component = "catalog",
            op = "register_images",
            requested = total,
            affected = report.registered.len(),
            cancelled = report.cancelled,
            "Registered images"
        );
        Ok(report)
    }

    pub async fn create_folder(&self, parent_id: Option<Uuid>, path: &str) -> Result<Uuid> {
        self.images.create_folder(parent_id, path).await
    }

    /// Delete images, repairing borrowers of deleted representatives.
    pub async fn delete_images(&self, ids: &[Uuid]) -> Result<RepairReport> {
        if ids.is_empty() {
            return Ok(RepairReport::default());
        }
        let report = self.images.delete_images(ids).await?;
        log_repair("delete_images", ids.len(), &report);
        Ok(report)
    }

    /// Delete a folder with its descendants and images.
    pub async fn delete_folder(&self, folder_id: Uuid) -> Result<RepairReport> {
        let report = self.images.delete_folder(folder_id).await?;
        log_repair("delete_folder", 1, &report);
        Ok(report)
    }
}

fn log_repair(op: &str, requested: usize, report: &RepairReport) {
    if report.affected_images.is_empty() {
        info!(
            subsystem = "jobs",
            component = "catalog",
            op,
            requested,
            "Deleted"
        );
    } else {
        warn!(
            subsystem = "jobs",
            component = "catalog",
            op,
            requested,
            representatives = report.representatives.len(),
            affected = report.affected_images.len(),
            "Deleted representatives; borrowers need re-embedding"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_db::MemoryStore;

    fn catalog() -> Catalog {
        Catalog::from_repositories(&Repositories::memory(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_register_in_chunks_keeps_order() {
        let catalog = catalog().with_chunk_size(3);
        let images: Vec<NewImage> = (0..10)
            .map(|n| NewImage::new(format!("img_{n}.png"), 100))
            .collect();
        let report = catalog
            .register_images(images, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.registered.len(), 10);
        assert_eq!(report.skipped, 0);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_stores_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = catalog()
            .register_images(vec![NewImage::new("a.png", 1)], &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.registered.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_empty_filename_rejected() {
        let result = catalog()
            .register_images(vec![NewImage::new("  ", 1)], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_delete_nothing_is_noop() {
        let report = catalog().delete_images(&[]).await.unwrap();
        assert_eq!(report, RepairReport::default());
    }
}
