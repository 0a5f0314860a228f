use anyhow::{bail, Context};
use ch_capture::checkpoint::PositionStore;
use ch_capture::clickhouse::ClickHouseSink;
use ch_capture::config::ReplicationMode;
use ch_capture::mysql::MySqlSource;
use ch_capture::snapshot::resolve_tables;
use ch_capture::{Config, Error, Replicator, Snapshotter};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "ch-capture")]
#[command(about = "MySQL to ClickHouse replicator", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, value_enum, help = "Override replication.mode")]
    mode: Option<ModeArg>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Delete the saved binlog position before starting")]
    reset_position: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Snapshot,
    Cdc,
}

impl From<ModeArg> for ReplicationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Snapshot => ReplicationMode::Snapshot,
            ModeArg::Cdc => ReplicationMode::Cdc,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "ch-capture failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("Starting ch-capture");
    info!("Loading configuration from {:?}", args.config);

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(mode) = args.mode {
        config.replication.mode = mode.into();
    }
    config.validate().context("Invalid configuration")?;

    info!(
        mysql_host = %config.mysql.host,
        mysql_port = config.mysql.port,
        mysql_database = %config.mysql.database,
        clickhouse_url = %config.clickhouse.url,
        clickhouse_database = %config.clickhouse.database,
        mode = ?config.replication.mode,
        tables = ?config.replication.tables,
        batch_size = config.replication.batch_size,
        parallel_tables = config.replication.parallel_tables,
        "Configuration summary"
    );

    if args.reset_position {
        let mut store = PositionStore::new(&config.replication.position_file);
        info!(path = ?store.path(), "Resetting saved position");
        store
            .delete()
            .await
            .context("Failed to delete the position file")?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let source = Arc::new(MySqlSource::new(&config.mysql)?);
    let sink = Arc::new(ClickHouseSink::new(&config.clickhouse)?);

    let result = match config.replication.mode {
        ReplicationMode::Snapshot => {
            run_snapshot(&config, Arc::clone(&source), sink, shutdown.clone()).await
        }
        ReplicationMode::Cdc => run_cdc(&config, Arc::clone(&source), sink, shutdown.clone()).await,
    };

    if let Ok(source) = Arc::try_unwrap(source) {
        if let Err(e) = source.disconnect().await {
            warn!(error = %e, "Failed to close MySQL connections");
        }
    }
    result
}

async fn run_snapshot(
    config: &Config,
    source: Arc<MySqlSource>,
    sink: Arc<ClickHouseSink>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tables = resolve_tables(source.as_ref(), &config.replication.tables).await?;
    if tables.is_empty() {
        bail!("no tables to replicate in database '{}'", config.mysql.database);
    }

    let report = Snapshotter::new(source, sink, config.snapshot_options())
        .run(&tables, shutdown)
        .await?;

    for table in &report.tables {
        info!(
            table = %table.table,
            rows_written = table.rows_written,
            source_rows = ?table.source_rows,
            success = table.is_success(),
            "Table result"
        );
    }

    let report = report.into_result()?;
    info!(
        tables = report.tables.len(),
        rows = report.total_rows(),
        "All tables replicated successfully"
    );
    Ok(())
}

async fn run_cdc(
    config: &Config,
    source: Arc<MySqlSource>,
    sink: Arc<ClickHouseSink>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let replicator = Replicator::new(source, sink, config.replicator_options());

    match replicator.run(shutdown.clone()).await {
        Ok(stats) => {
            info!(
                events = stats.events(),
                rows_written = stats.rows_written,
                position = ?stats.last_position,
                "CDC replication finished"
            );
            if !shutdown.is_cancelled() {
                bail!("change feed closed unexpectedly");
            }
            Ok(())
        }
        Err(Error::Shutdown) => {
            info!("Stopped before the initial snapshot completed");
            Ok(())
        }
        Err(e @ Error::CheckpointExpired { .. }) => Err(e).context(format!(
            "Restart with --reset-position (or delete {:?}) to take a fresh snapshot",
            config.replication.position_file
        )),
        Err(e) => Err(e.into()),
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("ch_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ch_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
