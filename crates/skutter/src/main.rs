use clap::{Parser, Subcommand, ValueEnum};
use skutter_scheduler::{Scheduler, SchedulerConfig};
use skutter_storage::{ClusterStore, EventBusConfig, RedbStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "skutter", about = "Skutter Workload Scheduler")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler against a cluster store
    Run {
        /// Path to the redb database file
        #[arg(long, default_value = "./skutter.redb")]
        data_dir: PathBuf,
        /// Path to a YAML scheduler configuration
        #[arg(long, env = "SKUTTER_CONFIG")]
        config: Option<PathBuf>,
        /// Seconds to wait for in-flight bindings on shutdown
        #[arg(long, default_value_t = 5)]
        shutdown_timeout: u64,
    },
    /// Print pending and bound pod counts
    Status {
        /// Path to the redb database file
        #[arg(long, default_value = "./skutter.redb")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    match cli.command {
        Commands::Run {
            data_dir,
            config,
            shutdown_timeout,
        } => run(&data_dir, config.as_deref(), Duration::from_secs(shutdown_timeout)).await,
        Commands::Status { data_dir } => status(&data_dir),
    }
}

/// Run the scheduler until ctrl-c
async fn run(
    data_dir: &Path,
    config_path: Option<&Path>,
    shutdown_timeout: Duration,
) -> miette::Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SchedulerConfig::from_yaml_file(path)?
        }
        None => SchedulerConfig::default(),
    };

    let store = open_store(data_dir, &config)?;
    let scheduler = Arc::new(Scheduler::new(store, &config)?);

    let token = CancellationToken::new();
    let scheduler_token = token.clone();
    let mut scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(scheduler_token).await }
    });

    info!("Scheduler started with store at {}", data_dir.display());

    // Wait for shutdown signal, or for the scheduler to stop on its own
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
            info!("Shutting down gracefully...");
            token.cancel();

            match tokio::time::timeout(shutdown_timeout, &mut scheduler_handle).await {
                Ok(result) => log_exit(result),
                Err(_) => error!(
                    "Scheduler did not stop within {:?}, exiting with bindings in flight",
                    shutdown_timeout
                ),
            }
        }
        result = &mut scheduler_handle => {
            log_exit(result);
            return Err(miette::miette!("Scheduler stopped unexpectedly"));
        }
    }

    let counts = scheduler.queue().counts();
    info!(
        "Shutdown complete ({} active, {} backing off, {} unschedulable)",
        counts.active, counts.backoff, counts.unschedulable
    );

    Ok(())
}

fn log_exit(result: Result<skutter_scheduler::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Scheduler error: {:?}", miette::Report::new(e)),
        Err(e) => error!("Scheduler task failed: {}", e),
    }
}

/// Print pod counts from the store
fn status(data_dir: &Path) -> miette::Result<()> {
    let store = RedbStore::new(data_dir).map_err(|e| {
        miette::miette!("Failed to open storage at '{}': {}", data_dir.display(), e)
    })?;

    let total = store.list_pods()?.len();
    let pending = store.list_pending_pods()?.len();
    let nodes = store.list_nodes()?;

    println!("nodes:   {}", nodes.len());
    println!("pending: {}", pending);
    println!("bound:   {}", total.saturating_sub(pending));
    Ok(())
}

fn open_store(data_dir: &Path, config: &SchedulerConfig) -> miette::Result<Arc<dyn ClusterStore>> {
    let bus = EventBusConfig {
        capacity: config.observability.event_capacity.max(1),
    };
    let store = RedbStore::with_event_bus_config(data_dir, bus).map_err(|e| {
        miette::miette!("Failed to open storage at '{}': {}", data_dir.display(), e)
    })?;
    Ok(Arc::new(store))
}
