#![forbid(unsafe_code)]

//! `preview-pool`: per-workspace live preview session pool.
//!
//! `serve` runs the pool API with background sweep, reclaim, and retention
//! jobs. The other subcommands run a single maintenance pass and exit.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use preview_pool::activity::ActivityTracker;
use preview_pool::api::{self, ApiState};
use preview_pool::cache::{CacheInvalidator, CachePurge, HttpCachePurge};
use preview_pool::config::GlobalConfig;
use preview_pool::liveness::{platform_probe, HttpHealthProbe, LivenessChecker, TrackedProcessProbe};
use preview_pool::models::cloud_task::ReclaimScope;
use preview_pool::orchestrator::cleanup::WorkspaceCleanup;
use preview_pool::orchestrator::launcher::{LaunchSettings, ResourceLauncher};
use preview_pool::orchestrator::lifecycle::Lifecycle;
use preview_pool::orchestrator::pool::PoolManager;
use preview_pool::orchestrator::reclaimer::OrphanReclaimer;
use preview_pool::orchestrator::scheduler::{spawn_maintenance, TokioScheduler};
use preview_pool::orchestrator::workspace_locks::WorkspaceLocks;
use preview_pool::persistence::activity_repo::SqliteActivityStore;
use preview_pool::persistence::session_repo::SessionRepo;
use preview_pool::persistence::{db, retention};
use preview_pool::substrate::cloud::{CloudControl, HttpCloudControl};
use preview_pool::substrate::ports::PortAllocator;
use preview_pool::substrate::process::{ActiveChildren, CommandLauncher};
use preview_pool::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "preview-pool", about = "Live preview session pool", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pool API and background jobs (default).
    Serve,
    /// Run one eviction sweep.
    Sweep,
    /// Run one orphan reclamation pass.
    Reclaim {
        /// Restrict to one workspace.
        #[arg(long)]
        workspace: Option<String>,
        /// List orphans without stopping them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print pool utilisation as JSON.
    Stats,
}

/// Everything the subcommands share.
struct Services {
    config: Arc<GlobalConfig>,
    db: Arc<db::Database>,
    pool: Arc<PoolManager>,
    reclaimer: Arc<OrphanReclaimer>,
    cache: CacheInvalidator,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("preview-pool bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!("configuration loaded");

    let services = build_services(config).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(services).await,
        Command::Sweep => {
            let freed = services.pool.sweeper().sweep().await;
            info!(freed, "sweep finished");
            Ok(())
        }
        Command::Reclaim { workspace, dry_run } => {
            let scope = workspace.map_or(ReclaimScope::All, ReclaimScope::Workspace);
            if dry_run {
                let orphans = services.reclaimer.find_orphans(&scope).await?;
                for task in &orphans {
                    info!(task_ref = task.task_ref, workspace_id = task.workspace_id(), "orphan");
                }
                info!(count = orphans.len(), "dry run finished");
            } else {
                let stopped = services.reclaimer.reclaim(&scope).await;
                info!(stopped, "reclaim finished");
            }
            Ok(())
        }
        Command::Stats => {
            let stats = services.pool.stats().await?;
            let json = serde_json::to_string_pretty(&stats)
                .map_err(|err| AppError::Config(format!("failed to encode stats: {err}")))?;
            println!("{json}");
            Ok(())
        }
    }
}

async fn build_services(config: GlobalConfig) -> Result<Services> {
    let config = Arc::new(config);

    let db = Arc::new(db::connect(config.db_path()).await?);
    info!("database connected");

    let tracker = ActivityTracker::new(
        Arc::new(SqliteActivityStore::new(Arc::clone(&db))),
        config.pool.idle_threshold_seconds,
    );

    let children: ActiveChildren = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let processes = Arc::new(CommandLauncher::new(config.preview.clone(), Arc::clone(&children)));
    let liveness = LivenessChecker::new(
        Arc::new(TrackedProcessProbe::new(children, platform_probe())),
        Arc::new(HttpHealthProbe::from_config(&config.preview)?),
    );

    let cloud: Option<Arc<dyn CloudControl>> = match &config.cloud {
        Some(cloud) => Some(Arc::new(HttpCloudControl::new(cloud)?)),
        None => {
            info!("cloud control not configured; sessions run as local processes only");
            None
        }
    };
    let cache = match &config.cache {
        Some(cache) => {
            let backend: Arc<dyn CachePurge> = Arc::new(HttpCachePurge::new(cache)?);
            CacheInvalidator::new(Some(backend))
        }
        None => {
            info!("cache purge not configured");
            CacheInvalidator::disabled()
        }
    };

    let ports = Arc::new(PortAllocator::new(
        config.preview.port_range_start,
        config.preview.port_range_end,
    ));
    let launcher = Arc::new(ResourceLauncher::new(
        processes,
        cloud.clone(),
        ports,
        liveness.clone(),
        LaunchSettings::from_config(&config),
    ));

    let repo = SessionRepo::new(Arc::clone(&db));
    let lifecycle = Lifecycle::new(repo.clone(), tracker, launcher);
    let locks = Arc::new(WorkspaceLocks::new());
    let pool = Arc::new(PoolManager::new(
        lifecycle,
        liveness,
        Arc::clone(&locks),
        config.pool.clone(),
    ));
    let reclaimer = Arc::new(OrphanReclaimer::new(
        cloud,
        repo,
        locks,
        usize::try_from(config.pool.max_candidates_per_pass).unwrap_or(usize::MAX),
        config.pool.stop_timeout(),
    ));

    Ok(Services {
        config,
        db,
        pool,
        reclaimer,
        cache,
    })
}

async fn serve(services: Services) -> Result<()> {
    let Services {
        config,
        db,
        pool,
        reclaimer,
        cache,
    } = services;

    match pool.recover().instrument(info_span!("startup_recovery")).await {
        Ok(settled) => info!(settled, "registry reconciled"),
        Err(err) => error!(%err, "startup recovery failed"),
    }

    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), config.retention_days, ct.clone());
    info!("retention service started");

    let scheduler = TokioScheduler::new(ct.clone());
    let maintenance = spawn_maintenance(
        &scheduler,
        pool.sweeper(),
        Arc::clone(&reclaimer),
        pool.locks(),
        &config.pool,
    );
    info!(
        sweep_interval = config.pool.sweep_interval_seconds,
        reclaim_interval = config.pool.reclaim_interval_seconds,
        "maintenance jobs started"
    );

    let state = ApiState {
        pool: Arc::clone(&pool),
        cleanup: Arc::new(WorkspaceCleanup::new(
            Arc::clone(&pool),
            reclaimer,
            cache.clone(),
        )),
        cache,
    };
    let api_ct = ct.clone();
    let port = config.http_port;
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(state, port, api_ct).await {
            error!(%err, "pool API failed");
        }
    });

    info!(capacity = config.pool.capacity, "preview pool ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    match pool.shutdown().instrument(info_span!("graceful_shutdown")).await {
        Ok(stopped) => info!(stopped, "sessions stopped"),
        Err(err) => error!(%err, "error during graceful shutdown"),
    }

    let _ = tokio::join!(api_handle, retention_handle);
    for handle in maintenance {
        let _ = handle.await;
    }
    info!("preview-pool shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
