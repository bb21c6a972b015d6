//! Worker harness: claims items for every running kind and hands them to
//! registered [`EnrichmentHandler`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use lumen_core::defaults::{
    EVENT_BUS_CAPACITY, QUEUE_BATCH_SIZE, QUEUE_LEASE_SECS, WORKER_ITEM_TIMEOUT_SECS,
    WORKER_POLL_INTERVAL_MS,
};
use lumen_core::{CompletionOutcome, EnrichmentKind, QueueItem, Result, WorkerStatus};

use crate::dispatcher::QueueDispatcher;
use crate::handler::{EnrichmentHandler, ItemContext, ItemResult};

/// Configuration for the enrichment worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval when nothing was claimed, in milliseconds.
    pub poll_interval_ms: u64,
    /// Items claimed per kind per poll.
    pub batch_size: i64,
    /// Lease granted with each claim, in seconds.
    pub lease_secs: i64,
    /// Per-item handler timeout, in seconds.
    pub item_timeout_secs: u64,
    /// Whether to process at all.
    pub enabled: bool,
    /// Kinds this process serves. Empty means every kind with a handler.
    pub kinds: Vec<EnrichmentKind>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: WORKER_POLL_INTERVAL_MS,
            batch_size: QUEUE_BATCH_SIZE,
            lease_secs: QUEUE_LEASE_SECS,
            item_timeout_secs: WORKER_ITEM_TIMEOUT_SECS,
            enabled: true,
            kinds: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LUMEN_WORKER_ENABLED` | `true` | Enable/disable processing |
    /// | `LUMEN_BATCH_SIZE` | `16` | Items claimed per kind per poll |
    /// | `LUMEN_POLL_INTERVAL_MS` | `2000` | Polling interval when idle |
    /// | `LUMEN_LEASE_SECS` | `600` | Claim lease length |
    /// | `LUMEN_WORKER_KINDS` | all | Comma-separated kinds to serve |
    pub fn from_env() -> Self {
        let enabled = std::env::var("LUMEN_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let batch_size = std::env::var("LUMEN_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(QUEUE_BATCH_SIZE)
            .max(1);

        let poll_interval_ms = std::env::var("LUMEN_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(WORKER_POLL_INTERVAL_MS);

        let lease_secs = std::env::var("LUMEN_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(QUEUE_LEASE_SECS)
            .max(1);

        let kinds = std::env::var("LUMEN_WORKER_KINDS")
            .map(|v| parse_kinds(&v))
            .unwrap_or_default();

        Self {
            poll_interval_ms,
            batch_size,
            lease_secs,
            item_timeout_secs: WORKER_ITEM_TIMEOUT_SECS,
            enabled,
            kinds,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_lease_secs(mut self, secs: i64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn with_item_timeout(mut self, secs: u64) -> Self {
        self.item_timeout_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<EnrichmentKind>) -> Self {
        self.kinds = kinds;
        self
    }
}

/// Parse a comma-separated kind list, skipping unknown names.
pub fn parse_kinds(value: &str) -> Vec<EnrichmentKind> {
    let mut kinds = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name.parse::<EnrichmentKind>() {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring worker kind"),
        }
    }
    kinds
}

/// Event emitted by the enrichment worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    ItemStarted {
        item_id: Uuid,
        image_id: Uuid,
        kind: EnrichmentKind,
    },
    ItemProgress {
        item_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    ItemCompleted {
        item_id: Uuid,
        kind: EnrichmentKind,
    },
    ItemFailed {
        item_id: Uuid,
        kind: EnrichmentKind,
        error: String,
    },
    /// Expired leases were returned to the queue.
    LeasesReleased { count: u64 },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop after its current batch.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| lumen_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn shutdown_and_wait(self) -> Result<()> {
        // The loop may already have exited (disabled worker); that is fine.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| lumen_core::Error::Internal(format!("Worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<EnrichmentKind, Arc<dyn EnrichmentHandler>>>>;

/// Polls the queue for every kind whose worker record is `running`.
///
/// Pausing or stopping a kind through the dispatcher (from any process)
/// takes effect at the next poll; items already claimed finish normally.
pub struct EnrichmentWorker {
    dispatcher: QueueDispatcher,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl EnrichmentWorker {
    pub fn new(dispatcher: QueueDispatcher, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let dispatcher = dispatcher.with_lease(chrono::Duration::seconds(config.lease_secs));
        Self {
            dispatcher,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for its kind, replacing any previous one.
    pub async fn register_handler<H: EnrichmentHandler + 'static>(&self, handler: H) {
        let kind = handler.kind();
        self.handlers.write().await.insert(kind, Arc::new(handler));
        debug!(%kind, "Registered enrichment handler");
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker", owner = %self.dispatcher.owner()))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Enrichment worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_secs,
            "Enrichment worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Enrichment worker received shutdown signal");
                break;
            }

            let mut tasks = tokio::task::JoinSet::new();
            for item in self.claim_round().await {
                let worker = self.clone_refs();
                tasks.spawn(async move {
                    worker.execute_item(item).await;
                });
            }

            if tasks.is_empty() {
                self.release_leases().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Enrichment worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(claimed = tasks.len(), "Processing claimed batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Item task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Enrichment worker stopped");
    }

    /// Kinds to poll: configured ones (or all) that have a handler.
    async fn served_kinds(&self) -> Vec<EnrichmentKind> {
        let handlers = self.handlers.read().await;
        EnrichmentKind::ALL
            .into_iter()
            .filter(|k| handlers.contains_key(k))
            .filter(|k| self.config.kinds.is_empty() || self.config.kinds.contains(k))
            .collect()
    }

    /// Claim one batch for every running kind.
    async fn claim_round(&self) -> Vec<QueueItem> {
        let mut claimed = Vec::new();
        for kind in self.served_kinds().await {
            match self.dispatcher.worker_state(kind).await {
                Ok(state) if state.status == WorkerStatus::Running => {}
                Ok(_) => continue,
                Err(e) => {
                    error!(error = ?e, %kind, "Failed to read worker state");
                    continue;
                }
            }
            match self.dispatcher.claim_batch(kind, self.config.batch_size).await {
                Ok(items) => claimed.extend(items),
                Err(e) => error!(error = ?e, %kind, "Failed to claim items"),
            }
        }
        claimed
    }

    async fn release_leases(&self) {
        match self.dispatcher.release_expired_leases().await {
            Ok(0) => {}
            Ok(count) => {
                warn!(affected = count, "Released expired leases");
                let _ = self.event_tx.send(WorkerEvent::LeasesReleased { count });
            }
            Err(e) => error!(error = ?e, "Failed to release expired leases"),
        }
    }

    fn clone_refs(&self) -> WorkerRef {
        WorkerRef {
            dispatcher: self.dispatcher.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            item_timeout: Duration::from_secs(self.config.item_timeout_secs),
        }
    }
}

/// Reference bundle for executing a single item in a spawned task.
struct WorkerRef {
    dispatcher: QueueDispatcher,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    item_timeout: Duration,
}

impl WorkerRef {
    async fn execute_item(self, item: QueueItem) {
        let start = Instant::now();
        let item_id = item.id;
        let kind = item.kind;

        debug!(%item_id, %kind, image_id = %item.image_id, "Processing item");
        let _ = self.event_tx.send(WorkerEvent::ItemStarted {
            item_id,
            image_id: item.image_id,
            kind,
        });

        let handler = self.handlers.read().await.get(&kind).cloned();
        let result = match handler {
            Some(handler) => {
                let event_tx = self.event_tx.clone();
                let ctx = ItemContext::new(item).with_progress_callback(move |percent, message| {
                    let _ = event_tx.send(WorkerEvent::ItemProgress {
                        item_id,
                        percent,
                        message: message.map(String::from),
                    });
                });
                match tokio::time::timeout(self.item_timeout, handler.process(ctx)).await {
                    Ok(result) => result,
                    Err(_) => ItemResult::Failed(format!(
                        "Item exceeded timeout of {}s",
                        self.item_timeout.as_secs()
                    )),
                }
            }
            None => ItemResult::Failed(format!("No handler for kind: {kind}")),
        };

        match result {
            ItemResult::Success => match self.dispatcher.complete(item_id).await {
                Ok(CompletionOutcome::Completed) => {
                    if let Err(e) = self.dispatcher.increment_counters(kind, 1, 0).await {
                        error!(error = ?e, %kind, "Failed to update worker counters");
                    }
                    info!(
                        %item_id,
                        %kind,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Item completed"
                    );
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::ItemCompleted { item_id, kind });
                }
                Ok(CompletionOutcome::AlreadyCompleted) => {}
                Err(e) => error!(error = ?e, %item_id, "Failed to mark item completed"),
            },
            ItemResult::Failed(message) => {
                if let Err(e) = self.dispatcher.fail(item_id, &message).await {
                    error!(error = ?e, %item_id, "Failed to mark item failed");
                    return;
                }
                if let Err(e) = self.dispatcher.increment_counters(kind, 0, 1).await {
                    error!(error = ?e, %kind, "Failed to update worker counters");
                }
                if let Err(e) = self.dispatcher.record_error(kind, &message).await {
                    error!(error = ?e, %kind, "Failed to record worker error");
                }
                warn!(
                    %item_id,
                    %kind,
                    error = %message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Item failed"
                );
                let _ = self.event_tx.send(WorkerEvent::ItemFailed {
                    item_id,
                    kind,
                    error: message,
                });
            }
        }
    }
}

/// Builder for an enrichment worker with handlers.
pub struct WorkerBuilder {
    dispatcher: QueueDispatcher,
    config: WorkerConfig,
    handlers: Vec<Box<dyn EnrichmentHandler>>,
}

impl WorkerBuilder {
    pub fn new(dispatcher: QueueDispatcher) -> Self {
        Self {
            dispatcher,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: EnrichmentHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub async fn build(self) -> EnrichmentWorker {
        let worker = EnrichmentWorker::new(self.dispatcher, self.config);
        {
            let mut handlers = worker.handlers.write().await;
            for handler in self.handlers {
                handlers.insert(handler.kind(), Arc::from(handler));
            }
        }
        worker
    }
}
