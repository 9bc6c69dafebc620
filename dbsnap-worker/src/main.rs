mod config;
mod db;
mod models;
mod services;
mod state;

use crate::config::WorkerConfig;
use crate::db::connection::{create_pool, with_conn};
use crate::db::migrate::migrate;
use crate::models::{schedule, source};
use crate::services::processors::{register_all, request_diff, request_restore, request_snapshot};
use crate::services::scheduler::SnapshotScheduler;
use crate::state::AppState;
use clap::{Args, Parser, Subcommand};
use dbsnap_core::diff::DiffEngine;
use dbsnap_core::jobs::{DiffJob, LiveSource, RestoreJob, RESTORE_QUEUE};
use dbsnap_core::restore::{RestoreEngine, RestoreMode};
use dbsnap_core::utils::logger;
use dbsnap_core::{ConnectionOptions, Engine};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for running jobs.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dbsnap-worker", version, about = "Database snapshot, diff and restore worker")]
struct Cli {
    /// Overrides LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job dispatcher, concurrency controller and cron schedules
    Serve,
    /// Compare two stored snapshots
    Diff {
        key_a: String,
        key_b: String,
        #[arg(long, default_value = "postgresql")]
        engine: Engine,
        /// Run as a tracked job and store the result next to the snapshots
        #[arg(long)]
        store: bool,
    },
    /// Compare a stored snapshot against the live database and store the result
    DiffLive {
        key: String,
        #[arg(long)]
        engine: Engine,
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Print structure counts of a stored snapshot
    Summary { key: String },
    /// Register a database to snapshot
    AddSource {
        #[arg(long)]
        project: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        engine: Engine,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[arg(long, default_value_t = 7)]
        max_snapshots: i64,
        /// Six-field cron expression, e.g. "0 0 3 * * *"
        #[arg(long)]
        cron: Option<String>,
    },
    /// List registered sources
    Sources,
    /// Pause or resume scheduled snapshots of a source
    SetEnabled {
        source_id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// List snapshots of a source, newest first
    Snapshots { source_id: String },
    /// Snapshot a registered source now and wait for it
    Snapshot { source_id: String },
    /// Replay a stored snapshot into a database and wait for it
    Restore {
        key: String,
        #[arg(long)]
        target_engine: String,
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Comma-separated tables or collections; all when omitted
        #[arg(long, value_delimiter = ',')]
        structures: Vec<String>,
        #[arg(long, default_value = "APPEND")]
        mode: RestoreMode,
    },
}

#[derive(Args)]
struct ConnectionArgs {
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, env = "DBSNAP_DB_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Database name, or file path for SQLite
    #[arg(long)]
    database: String,
}

impl From<ConnectionArgs> for ConnectionOptions {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionOptions {
            host: args.host,
            port: args.port,
            username: args.username,
            password: args.password,
            database: args.database,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;
    logger::init(cli.log_level.as_deref().unwrap_or(&config.log_level))?;

    std::fs::create_dir_all(&config.data_dir)?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = create_pool(&config.db_path.to_string_lossy())?;
    migrate(&pool)?;
    let state = Arc::new(AppState::new(pool, config)?);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state.clone()).await,
        Command::Diff {
            key_a,
            key_b,
            engine,
            store,
        } => diff(&state, key_a, key_b, engine, store).await,
        Command::DiffLive {
            key,
            engine,
            connection,
        } => {
            let job = DiffJob {
                key_a: key,
                key_b: None,
                live: Some(LiveSource {
                    engine,
                    connection: connection.into(),
                }),
                engine,
            };
            run_tracked_diff(&state, job).await
        }
        Command::Summary { key } => {
            let summary = RestoreEngine::new(state.storage.clone()).snapshot_summary(&key).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::AddSource {
            project,
            name,
            engine,
            connection,
            max_snapshots,
            cron,
        } => {
            let data = source::CreateSourceData {
                project_id: project,
                name,
                engine,
                connection: connection.into(),
                max_snapshots,
            };
            let created = with_conn(&state.db, move |conn| {
                let created = source::create(conn, &data)?;
                if let Some(cron) = cron {
                    schedule::create(conn, &created.id, &cron)?;
                }
                Ok(created)
            })
            .await?;
            println!("{}", created.id);
            Ok(())
        }
        Command::Sources => {
            let sources = with_conn(&state.db, source::find_all).await?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
            Ok(())
        }
        Command::SetEnabled { source_id, enabled } => {
            let id = source_id.clone();
            if with_conn(&state.db, move |conn| source::set_enabled(conn, &id, enabled)).await? {
                Ok(())
            } else {
                Err(anyhow::anyhow!("Source not found: {}", source_id))
            }
        }
        Command::Snapshots { source_id } => {
            let snapshots = with_conn(&state.db, move |conn| models::snapshot::find_by_source_id(conn, &source_id)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
            Ok(())
        }
        Command::Snapshot { source_id } => snapshot_now(state.clone(), &source_id).await,
        Command::Restore {
            key,
            target_engine,
            connection,
            structures,
            mode,
        } => {
            let job = RestoreJob {
                key,
                target_engine,
                connection: connection.into(),
                structures,
                mode,
            };
            run_queued(&state, |state| async move { request_restore(&state, job).await }).await?;
            if state.queue.failed(RESTORE_QUEUE) > 0 {
                anyhow::bail!("Restore failed; see log for details");
            }
            Ok(())
        }
    };

    db::connection::close_pool(&state.db);
    result
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!(db = %state.config.db_path.display(), "Starting snapshot worker");
    let cancel = CancellationToken::new();

    let interrupted = with_conn(&state.db, models::snapshot::fail_interrupted).await?;
    if interrupted > 0 {
        tracing::warn!(count = interrupted, "Marked snapshots left in flight by a previous run as failed");
    }

    register_all(&state);
    let dispatcher = state.queue.clone().run(cancel.clone());
    let controller = state.controller.clone().spawn(state.queue.clone(), cancel.clone());

    let scheduler = match SnapshotScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    shutdown_signal(cancel.clone()).await;
    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    let _ = tokio::join!(dispatcher, controller);
    state.queue.wait_idle(DRAIN_TIMEOUT).await;
    tracing::info!("Worker stopped");
    Ok(())
}

async fn diff(state: &Arc<AppState>, key_a: String, key_b: String, engine: Engine, store: bool) -> anyhow::Result<()> {
    if store {
        let job = DiffJob {
            key_a,
            key_b: Some(key_b),
            live: None,
            engine,
        };
        run_tracked_diff(state, job).await?;
    } else {
        let result = DiffEngine::for_engine(engine)
            .compare_snapshots(state.storage.as_ref(), &key_a, &key_b)
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

async fn run_tracked_diff(state: &Arc<AppState>, job: DiffJob) -> anyhow::Result<()> {
    let diff_id = run_queued(state, |state| async move { request_diff(&state, job).await }).await?;
    let id = diff_id.clone();
    let record = with_conn(&state.db, move |conn| models::diff::find_by_id(conn, &id))
        .await?
        .ok_or_else(|| anyhow::anyhow!("Diff not found: {}", diff_id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status != models::snapshot::STATUS_COMPLETED {
        anyhow::bail!("Diff {} ended as {}", record.id, record.status);
    }
    Ok(())
}

/// Enqueues through `request` and dispatches until every queue is empty, retries included.
async fn run_queued<F, Fut>(state: &Arc<AppState>, request: F) -> anyhow::Result<String>
where
    F: FnOnce(Arc<AppState>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<String>>,
{
    let cancel = CancellationToken::new();
    register_all(state);
    let dispatcher = state.queue.clone().run(cancel.clone());

    let id = request(state.clone()).await;
    if id.is_ok() {
        state.queue.wait_drained().await;
    }
    cancel.cancel();
    let _ = dispatcher.await;
    id
}

async fn snapshot_now(state: Arc<AppState>, source_id: &str) -> anyhow::Result<()> {
    let source_id = source_id.to_string();
    let snapshot_id = run_queued(&state, |state| async move { request_snapshot(&state, &source_id).await }).await?;

    let id = snapshot_id.clone();
    let snap = with_conn(&state.db, move |conn| models::snapshot::find_by_id(conn, &id))
        .await?
        .ok_or_else(|| anyhow::anyhow!("Snapshot not found: {}", snapshot_id))?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    if snap.status != models::snapshot::STATUS_COMPLETED {
        anyhow::bail!("Snapshot {} ended as {}", snap.id, snap.status);
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
