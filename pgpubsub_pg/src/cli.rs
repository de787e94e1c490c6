//! The `listen` command surface.
//!
//! The binary shape is owned by the application (it must register its
//! channels and filters first); this module supplies the argument parser,
//! the logger setup, and the entry point that wires the registry, the
//! supervisor, and the metrics task together:
//!
//! ```rust,ignore
//! use clap::Parser;
//!
//! let args = pgpubsub_pg::cli::ListenArgs::parse();
//! pgpubsub_pg::cli::init_logging(&args)?;
//! pgpubsub_pg::cli::run_listen(pool, registry, &filters, config, &args).await?;
//! ```

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::info;
use pgpubsub_core::{AcceptAll, ColumnRowDecoder, FilterRegistry, ListenerFilter};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::dispatcher::Dispatcher;
use crate::metrics::spawn_metrics_task;
use crate::registry::{ChannelRegistry, RegistryError};
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::worker::{Worker, WorkerError};

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Arguments of the `listen` command.
#[derive(Debug, Parser)]
#[command(name = "listen", about = "Listen to registered postgres channels for notifications")]
pub struct ListenArgs {
    /// Restrict the subscription set; defaults to all registered channels.
    #[arg(long, num_args = 1.., value_name = "NAME")]
    pub channels: Vec<String>,

    /// Run N workers under one supervisor.
    #[arg(long, value_name = "N", conflicts_with = "worker")]
    pub processes: Option<usize>,

    /// Run exactly one worker, no supervisor.
    #[arg(long)]
    pub worker: bool,

    /// Replay stored notifications for durable channels before going live.
    #[arg(long)]
    pub recover: bool,

    /// Do not replace crashed workers.
    #[arg(long)]
    pub no_restart_on_failure: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Log format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub logformat: LogFormat,
}

/// Errors that end the command before any worker runs.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// A `--channels` name is not registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// `PGPUBSUB_LISTENER_FILTER` names an unregistered filter.
    #[error("listener filter '{0}' is not registered")]
    UnknownFilter(String),

    /// `--loglevel` did not parse.
    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),

    /// The database was unreachable at init.
    #[error("database unavailable: {0}")]
    Database(#[from] sqlx::Error),

    /// The single `--worker` run ended with a fatal error.
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Initializes the `log`/`env_logger` pipeline from the CLI flags.
pub fn init_logging(args: &ListenArgs) -> Result<(), CliError> {
    let level: log::LevelFilter = args
        .loglevel
        .parse()
        .map_err(|_| CliError::InvalidLogLevel(args.loglevel.clone()))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if args.logformat == LogFormat::Json {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                })
            )
        });
    }
    // A second init (e.g. in tests) is harmless.
    let _ = builder.try_init();
    Ok(())
}

/// Runs the `listen` command until shutdown.
///
/// Returns an error only for unrecoverable startup problems (unknown
/// channel or filter, unreachable database) or, in `--worker` mode, a fatal
/// worker error; a supervisor with restart enabled never propagates
/// individual worker failures.
pub async fn run_listen(
    pool: PgPool,
    registry: Arc<ChannelRegistry>,
    filters: &FilterRegistry,
    mut config: ListenerConfig,
    args: &ListenArgs,
) -> Result<(), CliError> {
    config.recover = config.recover || args.recover;
    if args.no_restart_on_failure {
        config.restart_policy = RestartPolicy::Never;
    }

    let channels = registry.select(&args.channels)?;
    let filter: Arc<dyn ListenerFilter> = match &config.listener_filter {
        Some(name) => filters
            .get(name)
            .ok_or_else(|| CliError::UnknownFilter(name.clone()))?,
        None => Arc::new(AcceptAll),
    };

    // Fail fast if the database is unreachable.
    sqlx::query("SELECT 1").execute(&pool).await?;

    let config = Arc::new(config);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        config.clone(),
        filter,
        Arc::new(ColumnRowDecoder::new()),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received");
            signal_token.cancel();
        }
    });

    let metrics_handle = spawn_metrics_task(
        pool.clone(),
        channels.iter().map(|d| d.name.clone()).collect(),
        config.metric_prefix.clone(),
        config.metric_interval,
        shutdown.clone(),
    );

    if args.worker {
        let worker = Worker::new(0, pool, dispatcher, config, channels);
        worker.run(shutdown.clone()).await?;
    } else {
        let supervisor = Supervisor::new(pool, dispatcher, config, channels);
        supervisor
            .run(args.processes.unwrap_or(1), shutdown.clone())
            .await;
    }

    shutdown.cancel();
    let _ = metrics_handle.await;
    Ok(())
}
