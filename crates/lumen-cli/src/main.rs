//! lumen: operator command line for enrichment scheduling, embedding
//! deduplication and duplicate clustering.
//!
//! Every command connects to PostgreSQL (`DATABASE_URL`), performs one
//! operation and prints its result as JSON on stdout. Long sweeps stop at
//! the next page boundary on Ctrl-C.

use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use lumen_core::defaults::{
    QUEUED_BY_SMART_QUEUE, QUEUE_DEFAULT_PRIORITY, QUEUE_MAX_BATCH_SIZE, SIMILARITY_NEIGHBOURS,
    SIMILARITY_THRESHOLD,
};
use lumen_db::{log_pool_usage, Database, PoolConfig, Repositories};
use lumen_jobs::{DedupCache, EnrichmentKind, QueueDispatcher, TaskStateTracker};
use lumen_search::{ClusterConfig, ParameterGrouping, RecallTarget, SimilarityClusterer};

#[derive(Parser)]
#[command(name = "lumen")]
#[command(author, version, about = "Enrichment scheduling and duplicate detection for an image catalog")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/lumen")]
    database_url: String,

    /// Maximum pool connections (default: DB_MAX_CONNECTIONS or 10)
    #[arg(long)]
    max_connections: Option<u32>,

    /// Seconds to wait for a free connection (default: DB_ACQUIRE_TIMEOUT_SECS or 30)
    #[arg(long)]
    acquire_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Show queue, flag and worker counters
    Stats {
        /// Limit to one enrichment kind
        #[arg(short, long)]
        kind: Option<EnrichmentKind>,
    },

    /// Control the persisted worker lifecycle
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Send failed items below their retry bound back to pending
    RetryFailed {
        #[arg(short, long)]
        kind: Option<EnrichmentKind>,
    },

    /// Remove finished queue rows
    Clear {
        #[arg(short, long)]
        kind: Option<EnrichmentKind>,

        /// Remove every row, including pending and processing ones
        #[arg(long)]
        all: bool,

        /// Also return pending flags of the kind to never-queued
        #[arg(long, requires = "kind")]
        flags: bool,
    },

    /// Return items with expired leases to the queue
    ReleaseLeases,

    /// Flag images for processing and materialize queue rows
    Enqueue(EnqueueArgs),

    /// Fingerprint new images and elect group representatives
    Fingerprint,

    /// Copy representative embeddings to their groups
    Propagate,

    /// Clear embedding references left pointing at deleted or demoted sources
    Repair,

    /// Find near-duplicate clusters
    Clusters(ClusterArgs),

    /// Find draft/final variant pairs
    Variants {
        /// Parameter grouping strategy
        #[arg(long, default_value = "seed_model_prompt")]
        grouping: ParameterGrouping,
    },

    /// Delete unreferenced embedding cache entries
    PruneCache {
        /// Idle time before an entry may be pruned (default: 24)
        #[arg(long)]
        max_age_hours: Option<i64>,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Mark the kind's worker running
    Start { kind: EnrichmentKind },
    /// Stop claiming new items; claimed items finish
    Pause { kind: EnrichmentKind },
    /// Mark the kind's worker stopped
    Stop { kind: EnrichmentKind },
    /// Zero the processed and failed counters
    Reset { kind: EnrichmentKind },
    /// Show the worker record
    Status { kind: Option<EnrichmentKind> },
}

#[derive(Args)]
struct EnqueueArgs {
    /// Enrichment kind to queue
    kind: EnrichmentKind,

    /// Image ids to flag
    #[arg(conflicts_with = "folder")]
    ids: Vec<Uuid>,

    /// Flag every image in a folder
    #[arg(long)]
    folder: Option<Uuid>,

    /// Include descendant folders
    #[arg(long, requires = "folder")]
    recursive: bool,

    /// Reopen completed work (ignored for write-once kinds)
    #[arg(long)]
    reprocess: bool,

    /// Priority of the materialized queue rows
    #[arg(long, default_value_t = QUEUE_DEFAULT_PRIORITY)]
    priority: i32,

    /// Maximum queue rows to materialize
    #[arg(long, default_value_t = QUEUE_MAX_BATCH_SIZE)]
    limit: i64,
}

#[derive(Args)]
struct ClusterArgs {
    /// Minimum cosine similarity of a duplicate pair
    #[arg(long, default_value_t = SIMILARITY_THRESHOLD)]
    threshold: f32,

    /// Neighbours fetched per image
    #[arg(long, default_value_t = SIMILARITY_NEIGHBOURS)]
    neighbours: i64,

    /// Recall/latency trade-off for the vector index
    #[arg(long, default_value = "balanced")]
    recall: RecallTarget,

    /// Replace the persisted clusters with the result
    #[arg(long)]
    materialize: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _file_guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing from the environment.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, daily rotation)
///   RUST_LOG    - standard env filter (default: "lumen=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lumen=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_file {
        Some(ref path) => {
            let path = std::path::Path::new(path);
            let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("lumen.log");
            let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if log_format == "json" {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            // stdout is reserved for command output.
            if log_format == "json" {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            } else {
                registry
                    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
            None
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(subsystem = "cli", "Interrupt received, stopping at the next page");
            cancel.cancel();
        }
    });
    token
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn kinds(kind: Option<EnrichmentKind>) -> Vec<EnrichmentKind> {
    kind.map_or_else(|| EnrichmentKind::ALL.to_vec(), |k| vec![k])
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut pool_config = PoolConfig::from_env();
    if let Some(n) = cli.max_connections {
        pool_config = pool_config.with_max_connections(n);
    }
    if let Some(secs) = cli.acquire_timeout_secs {
        pool_config = pool_config.with_acquire_timeout(std::time::Duration::from_secs(secs));
    }
    let db = Database::connect_with_config(&cli.database_url, &pool_config)
        .await
        .context("connecting to database")?;

    let repos = db.repositories();
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Migrate => {
            db.migrate().await.context("running migrations")?;
            info!(subsystem = "cli", op = "migrate", "Database migrations complete");
            Ok(())
        }
        Commands::Stats { kind } => {
            let usage = log_pool_usage(db.pool());
            let pool = json!({
                "size": usage.size,
                "idle": usage.idle,
                "in_use": usage.in_use(),
                "max_connections": usage.max_connections,
            });
            cmd_stats(&repos, kinds(kind), pool).await
        }
        Commands::Worker { action } => cmd_worker(&repos, action).await,
        Commands::RetryFailed { kind } => {
            let retried = QueueDispatcher::from_repositories(&repos)
                .retry_failed(kind)
                .await?;
            print_json(&json!({ "retried": retried }))
        }
        Commands::Clear { kind, all, flags } => cmd_clear(&repos, kind, all, flags).await,
        Commands::ReleaseLeases => {
            let released = QueueDispatcher::from_repositories(&repos)
                .release_expired_leases()
                .await?;
            print_json(&json!({ "released": released }))
        }
        Commands::Enqueue(args) => cmd_enqueue(&repos, args).await,
        Commands::Fingerprint => {
            let dedup = DedupCache::from_repositories(&repos);
            let fingerprinted = dedup.compute_fingerprints(&cancel).await?;
            let elected = dedup.elect_representatives(&cancel).await?;
            print_json(&json!({
                "fingerprinted": fingerprinted,
                "groups_changed": elected,
                "cancelled": cancel.is_cancelled(),
            }))
        }
        Commands::Propagate => {
            let report = DedupCache::from_repositories(&repos)
                .propagate_embeddings(&cancel)
                .await?;
            print_json(&report)
        }
        Commands::Repair => {
            let report = DedupCache::from_repositories(&repos)
                .repair_all_dangling()
                .await?;
            print_json(&report)
        }
        Commands::Clusters(args) => cmd_clusters(&repos, args, &cancel).await,
        Commands::Variants { grouping } => {
            let config = ClusterConfig::default().with_grouping(grouping);
            let clusterer = SimilarityClusterer::new(repos.similarity.clone(), config)?;
            let filename = clusterer.filename_variants(&cancel).await?;
            let parameter = clusterer.parameter_variants(&cancel).await?;
            print_json(&json!({ "filename": filename, "parameter": parameter }))
        }
        Commands::PruneCache { max_age_hours } => {
            let pruned = DedupCache::from_repositories(&repos)
                .prune_cache(max_age_hours.map(chrono::Duration::hours))
                .await?;
            print_json(&json!({ "pruned": pruned }))
        }
    }
}

async fn cmd_stats(
    repos: &Repositories,
    kinds: Vec<EnrichmentKind>,
    pool: serde_json::Value,
) -> anyhow::Result<()> {
    let dispatcher = QueueDispatcher::from_repositories(repos);
    let tracker = TaskStateTracker::from_repositories(repos);
    let mut rows = Vec::with_capacity(kinds.len());
    for kind in kinds {
        rows.push(json!({
            "kind": kind,
            "queue": dispatcher.stats(kind).await?,
            "flags": tracker.counts(kind).await?,
            "worker": dispatcher.worker_state(kind).await?,
        }));
    }
    print_json(&json!({ "pool": pool, "kinds": rows }))
}

async fn cmd_worker(repos: &Repositories, action: WorkerAction) -> anyhow::Result<()> {
    let dispatcher = QueueDispatcher::from_repositories(repos);
    let state = match action {
        WorkerAction::Start { kind } => dispatcher.start(kind).await?,
        WorkerAction::Pause { kind } => dispatcher.pause(kind).await?,
        WorkerAction::Stop { kind } => dispatcher.stop(kind).await?,
        WorkerAction::Reset { kind } => {
            dispatcher.reset_counters(kind).await?;
            dispatcher.worker_state(kind).await?
        }
        WorkerAction::Status { kind } => {
            let mut states = Vec::new();
            for kind in kinds(kind) {
                states.push(dispatcher.worker_state(kind).await?);
            }
            return print_json(&states);
        }
    };
    print_json(&state)
}

async fn cmd_clear(
    repos: &Repositories,
    kind: Option<EnrichmentKind>,
    all: bool,
    flags: bool,
) -> anyhow::Result<()> {
    let dispatcher = QueueDispatcher::from_repositories(repos);
    let removed = if all {
        dispatcher.clear_all(kind).await?
    } else {
        dispatcher.clear_completed(kind).await?
    };
    let flags_cleared = match kind.filter(|_| flags) {
        Some(kind) => TaskStateTracker::from_repositories(repos)
            .clear_queue(kind)
            .await?,
        None => 0,
    };
    print_json(&json!({ "removed": removed, "flags_cleared": flags_cleared }))
}

async fn cmd_enqueue(repos: &Repositories, args: EnqueueArgs) -> anyhow::Result<()> {
    let tracker = TaskStateTracker::from_repositories(repos);
    let skip = !args.reprocess;
    let outcome = match args.folder {
        Some(folder) => {
            tracker
                .smart_queue_folder(args.kind, folder, args.recursive, skip)
                .await?
        }
        None => tracker.smart_queue(args.kind, &args.ids, skip).await?,
    };
    let enqueued = tracker
        .enqueue_flagged(args.kind, args.priority, QUEUED_BY_SMART_QUEUE, args.limit)
        .await?;
    print_json(&json!({
        "kind": args.kind,
        "requested": outcome.requested,
        "transitioned": outcome.transitioned,
        "enqueued": enqueued,
    }))
}

async fn cmd_clusters(
    repos: &Repositories,
    args: ClusterArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let config = ClusterConfig::default()
        .with_threshold(args.threshold)
        .with_neighbours(args.neighbours)
        .with_recall_target(args.recall);
    let clusterer = SimilarityClusterer::new(repos.similarity.clone(), config)?;
    let clusters = clusterer.find_clusters(cancel).await?;
    if args.materialize {
        let stored = clusterer.materialize(&clusters).await?;
        info!(subsystem = "cli", op = "materialize", affected = stored, "Clusters materialized");
    }
    print_json(&clusters)
}
