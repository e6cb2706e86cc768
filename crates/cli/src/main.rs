mod config_commands;
mod cron_commands;
mod system_jobs;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    fleetcron_config::{FleetcronConfig, StoreBackend},
    fleetcron_cron::{
        CronManager, CronManagerConfig, CronStore, ExecutionEngine,
        engine_local::{LocalEngine, LocalEngineConfig},
        manager::default_holder,
        store_memory::InMemoryStore,
        store_sqlite::SqliteStore,
    },
};

use crate::{
    config_commands::ConfigAction,
    cron_commands::{CreateArgs, StateAction},
};

#[derive(Parser)]
#[command(name = "fleetcron", about = "fleetcron: distributed periodic job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in `./` and `~/.config/fleetcron/`).
    #[arg(long, global = true, env = "FLEETCRON_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker that schedules jobs until interrupted.
    Worker,
    /// Create or redefine a job.
    Create(CreateArgs),
    /// List jobs.
    List {
        /// Print full job objects as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show one job as JSON.
    Show {
        id: String,
        /// Include field history and runs.
        #[arg(long)]
        history: bool,
    },
    /// Enable a job.
    Enable { id: String },
    /// Disable a job. A run in progress is left alone.
    Disable { id: String },
    /// Delete a job and its history.
    Delete { id: String },
    /// Run one scheduling pass now and wait for the runs it starts.
    Run {
        /// Start runs even if the jobs are not due.
        #[arg(long)]
        force: bool,
        /// Restrict the pass to these jobs.
        names: Vec<String>,
    },
    /// List recent runs of a job, newest first.
    Runs {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete runs of a job started before a cutoff.
    Prune {
        id: String,
        /// ISO 8601 time or an age such as `30d`.
        #[arg(long)]
        before: String,
    },
    /// Read or write a job's checkpoint.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the explicit config file, or discover one.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<FleetcronConfig> {
    match path {
        Some(path) => fleetcron_config::load_config(path),
        None => Ok(fleetcron_config::discover_and_load()),
    }
}

async fn build_store(config: &FleetcronConfig) -> anyhow::Result<Arc<dyn CronStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("using the in-memory store, jobs are lost on exit");
            Ok(Arc::new(InMemoryStore::new()))
        },
        StoreBackend::Sqlite => {
            let url = match config.store.database_url {
                Some(ref url) => url.clone(),
                None => fleetcron_config::default_database_url()?,
            };
            let store = SqliteStore::new(&url)
                .await
                .with_context(|| format!("failed to open cron store at {url}"))?;
            Ok(Arc::new(store))
        },
    }
}

async fn build_manager(
    config: &FleetcronConfig,
) -> anyhow::Result<(CronManager, Arc<LocalEngine>)> {
    let store = build_store(config).await?;
    // Runs are owned by the same identity that holds this process's leases.
    let holder = default_holder();
    let engine = Arc::new(
        LocalEngine::new(Arc::clone(&store), config.workflows.clone())
            .with_owner(holder.clone())
            .with_config(LocalEngineConfig {
                heartbeat_interval: Duration::from_secs(config.cron.run_heartbeat_secs),
                stale_after: Duration::from_secs(config.cron.run_stale_after_secs),
            }),
    );
    let manager_config = CronManagerConfig {
        lease_duration: Duration::from_secs(config.cron.lease_duration_secs),
        management_lease_attempts: config.cron.management_lease_attempts,
        management_lease_retry: Duration::from_millis(config.cron.management_lease_retry_ms),
    };
    let execution: Arc<dyn ExecutionEngine> = engine.clone();
    let manager = CronManager::new(store, execution, manager_config).with_holder(holder);
    Ok((manager, engine))
}

#[cfg(feature = "metrics")]
fn init_metrics(config: &fleetcron_config::MetricsConfig) -> anyhow::Result<()> {
    let listen = config
        .listen
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("invalid metrics.listen address")?;
    fleetcron_metrics::init_metrics(fleetcron_metrics::MetricsRecorderConfig {
        enabled: config.enabled,
        listen,
        global_labels: config
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config_path = cli.config.as_deref();

    if let Commands::Config { action } = cli.command {
        return config_commands::handle_config(action, config_path);
    }

    let config = load_config(config_path)?;
    let (manager, engine) = build_manager(&config).await?;

    match cli.command {
        Commands::Worker => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                holder = manager.holder(),
                "fleetcron worker starting"
            );
            #[cfg(feature = "metrics")]
            init_metrics(&config.metrics)?;
            cron_commands::worker(manager, &engine, &config).await
        },
        Commands::Create(args) => cron_commands::create(&manager, args).await,
        Commands::List { json } => cron_commands::list(&manager, json).await,
        Commands::Show { id, history } => cron_commands::show(&manager, &id, history).await,
        Commands::Enable { id } => Ok(manager.enable_job(&id).await?),
        Commands::Disable { id } => Ok(manager.disable_job(&id).await?),
        Commands::Delete { id } => Ok(manager.delete_job(&id).await?),
        Commands::Run { force, names } => {
            cron_commands::run(&manager, &engine, names, force).await
        },
        Commands::Runs { id, limit } => cron_commands::runs(&manager, &id, limit).await,
        Commands::Prune { id, before } => cron_commands::prune(&manager, &id, &before).await,
        Commands::State { action } => cron_commands::state(&manager, action).await,
        Commands::Config { .. } => Ok(()),
    }
}
