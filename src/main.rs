//! pipecron - distributed cron scheduling for recurring pipelines.
//!
//! Usage:
//!   pipecron run --config <file>       Run one crond replica
//!   pipecron validate --config <file>  Validate a configuration without running
//!   pipecron next <expr>               Print the next activation instants of an expression

use chrono::Utc;
use clap::{Parser, Subcommand};
use pipecron::api::{create_api_state, start_server};
use pipecron::config::{CoordinationConfig, StorageConfig};
use pipecron::coordination::{DistributedLock, SignalStore};
use pipecron::{
    ConfigLoader, CronService, Crond, CrondConfig, DryRunCleaner, Event, EventBus, EventHandler,
    InMemoryCoordinator, InMemoryStorage, InstanceId, LoggingTrigger, Schedule, Storage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// pipecron - distributed cron scheduling for recurring pipelines
#[derive(Parser)]
#[command(name = "pipecron")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crond replica
    Run {
        /// Path to the replica configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the replica configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Print the next activation instants of a cron expression
    Next {
        /// Six-field cron expression, quoted
        #[arg(value_name = "EXPR")]
        expr: String,

        /// Number of instants to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

/// Event handler that logs what the replica does.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::EntryFired { name, trigger_at, .. } => {
                info!("Entry '{}' fired for {}", name, trigger_at);
            }
            Event::LockContended { name, trigger_at, .. } => {
                info!("Entry '{}' at {} is held by another replica", name, trigger_at);
            }
            Event::LockFailed {
                name,
                trigger_at,
                error,
                ..
            } => {
                warn!("Entry '{}' at {} skipped, lock failed: {}", name, trigger_at, error);
            }
            Event::JobPanicked {
                name,
                trigger_at,
                message,
                ..
            } => {
                error!("Entry '{}' at {} panicked: {}", name, trigger_at, message);
            }
            Event::CronTriggered {
                cron_id,
                trigger_at,
                compensated,
                ..
            } => {
                let kind = if *compensated { " (compensated)" } else { "" };
                info!("Cron {} triggered for {}{}", cron_id, trigger_at, kind);
            }
            Event::CronSuppressed {
                cron_id,
                trigger_at,
                start_from,
                ..
            } => {
                info!(
                    "Cron {} at {} suppressed, starts from {}",
                    cron_id, trigger_at, start_from
                );
            }
            Event::CronTriggerFailed {
                cron_id,
                trigger_at,
                error,
                ..
            } => {
                error!("Cron {} at {} failed to trigger: {}", cron_id, trigger_at, error);
            }
            Event::GcBatchDeleted {
                cluster, deleted, ..
            } => {
                info!("Build-cache gc deleted {} image(s) on '{}'", deleted, cluster);
            }
            Event::GcBatchFailed { cluster, error, .. } => {
                warn!("Build-cache gc failed on '{}': {}", cluster, error);
            }
            Event::GcRecordRemoveFailed {
                cluster,
                name,
                error,
                ..
            } => {
                warn!(
                    "Build-cache record '{}' on '{}' could not be removed: {}",
                    name, cluster, error
                );
            }
            Event::Reloaded { entries, .. } => {
                info!("Crond reloaded with {} entrie(s)", entries);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = match config {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    ConfigLoader::load(&path)?
                }
                None => {
                    warn!("No configuration given, using in-memory defaults");
                    CrondConfig::default()
                }
            };
            run_replica(config).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Next { expr, count } => {
            print_next(&expr, count)?;
        }
    }

    Ok(())
}

/// Open the configured store and run the replica on it.
async fn run_replica(config: CrondConfig) -> Result<(), Box<dyn std::error::Error>> {
    match config.storage.clone() {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; definitions are lost on exit");
            serve(config, Arc::new(InMemoryStorage::new())).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Opening SQLite store: {}", path);
            let storage = Arc::new(pipecron::SqliteStorage::new(&path).await?);
            serve(config, storage).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the 'sqlite' feature".into())
        }
    }
}

type Coordination = (Arc<dyn SignalStore>, Arc<dyn DistributedLock>);

async fn connect_coordination(
    config: &CrondConfig,
    instance: InstanceId,
) -> Result<Coordination, Box<dyn std::error::Error>> {
    match &config.coordination {
        CoordinationConfig::Memory => {
            warn!("Using in-memory coordination; only this replica participates");
            let coordinator = Arc::new(InMemoryCoordinator::new());
            let lock: Arc<dyn DistributedLock> =
                Arc::new(coordinator.lock(config.lock_namespace.clone(), instance));
            let signals: Arc<dyn SignalStore> = coordinator;
            Ok((signals, lock))
        }
        #[cfg(feature = "etcd")]
        CoordinationConfig::Etcd { endpoints } => {
            info!("Connecting to etcd: {}", endpoints.join(","));
            let coordinator = pipecron::EtcdCoordinator::connect(endpoints).await?;
            let lock: Arc<dyn DistributedLock> = Arc::new(coordinator.lock(
                config.lock_namespace.clone(),
                instance,
                config.lock_ttl,
            ));
            let signals: Arc<dyn SignalStore> = Arc::new(coordinator);
            Ok((signals, lock))
        }
        #[cfg(not(feature = "etcd"))]
        CoordinationConfig::Etcd { .. } => {
            Err("etcd coordination requires the 'etcd' feature".into())
        }
    }
}

/// Run the daemon and, when enabled, the admin API until Ctrl+C.
async fn serve<S: Storage + 'static>(
    config: CrondConfig,
    storage: Arc<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    let instance = config
        .instance_id
        .clone()
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::generate);
    info!("Starting replica {}", instance);

    let (signals, lock) = connect_coordination(&config, instance).await?;

    let events = Arc::new(EventBus::new());
    events.register(Arc::new(LoggingHandler)).await;

    let crond = Crond::builder(Arc::clone(&storage), signals, Arc::new(LoggingTrigger))
        .lock(lock)
        .cleaner(Arc::new(DryRunCleaner))
        .events(events)
        .options(config.crond_options())
        .build();

    let cancel = CancellationToken::new();
    let watcher = crond.run(cancel.clone()).await?;

    let api = if config.api.enabled {
        let service = CronService::new(storage, crond.clone());
        let state = create_api_state(service);
        Some(start_server(config.api_config(), state, cancel.clone()).await?)
    } else {
        None
    };

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    cancel.cancel();
    if let Err(e) = watcher.await {
        error!("Signal watcher ended abnormally: {}", e);
    }
    if let Some(api) = api {
        if let Err(e) = api.await {
            error!("API server ended abnormally: {}", e);
        }
    }
    crond.shutdown().await;

    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match ConfigLoader::load(&path) {
        Ok(config) => {
            info!("Configuration is valid:");
            info!("  storage: {:?}", config.storage);
            info!("  coordination: {:?}", config.coordination);
            info!("  signal prefix: {}", config.signal_prefix);
            info!("  lock namespace: {}", config.lock_namespace);
            info!(
                "  compensator: {}",
                if config.compensator.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print the next activation instants of an expression.
fn print_next(expr: &str, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    let schedule = Schedule::new(expr)?;
    let instants = schedule.next_n_after(Utc::now(), count);

    if instants.is_empty() {
        println!("'{}' never fires again", expr);
        return Ok(());
    }

    println!("Next {} activation(s) of '{}':", instants.len(), expr);
    for at in instants {
        println!("  {}", at.to_rfc3339());
    }
    Ok(())
}
