//! Host-supplied enrichment handlers.

use async_trait::async_trait;
use uuid::Uuid;

use lumen_core::{EnrichmentKind, QueueItem};

/// Progress callback type for enrichment handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to a handler for one claimed item.
pub struct ItemContext {
    /// The claimed queue item.
    pub item: QueueItem,
    progress_callback: Option<ProgressCallback>,
}

impl ItemContext {
    pub fn new(item: QueueItem) -> Self {
        Self {
            item,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    pub fn image_id(&self) -> Uuid {
        self.item.image_id
    }

    pub fn kind(&self) -> EnrichmentKind {
        self.item.kind
    }
}

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    /// Enrichment stored; the item is completed.
    Success,
    /// Processing failed with an error message. The item may be retried later.
    Failed(String),
}

/// Performs the ML work of one enrichment kind.
#[async_trait]
pub trait EnrichmentHandler: Send + Sync {
    /// The kind this handler processes.
    fn kind(&self) -> EnrichmentKind;

    /// Process one claimed item.
    async fn process(&self, ctx: ItemContext) -> ItemResult;

    fn can_handle(&self, kind: EnrichmentKind) -> bool {
        self.kind() == kind
    }
}

/// Handler that succeeds immediately, for tests and dry runs.
pub struct NoOpHandler {
    kind: EnrichmentKind,
}

impl NoOpHandler {
    pub fn new(kind: EnrichmentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl EnrichmentHandler for NoOpHandler {
    fn kind(&self) -> EnrichmentKind {
        self.kind
    }

    async fn process(&self, ctx: ItemContext) -> ItemResult {
        ctx.report_progress(100, Some("Done"));
        ItemResult::Success
    }
}
