//! smartoj-sync - binlog CDC worker for SmartOJ
//!
//! ```bash
//! # Tail the binlog until Ctrl-C
//! smartoj-sync -c sync.yaml run
//!
//! # Check a configuration file
//! smartoj-sync -c sync.yaml validate
//!
//! # Inspect or reset the resume position
//! smartoj-sync -c sync.yaml checkpoint show
//! smartoj-sync -c sync.yaml checkpoint clear
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smartoj_sync::{
    broker,
    checkpoint::{Checkpoint, FilePositionStore, MemoryPositionStore, SharedPositionStore},
    config::{CheckpointBackend, CheckpointConfig, SyncConfig},
    directory::MySqlDirectory,
    events::ProgressNotifier,
    handlers::HandlerRegistry,
    index::ElasticsearchIndex,
    normalizer::MySqlColumnCatalog,
    notification_store::MySqlNotificationStore,
    pipeline::Pipeline,
    reader::{ReaderConfig, StreamReader},
};

#[derive(Parser)]
#[command(name = "smartoj-sync")]
#[command(version, about = "Keeps the SmartOJ search index and notifications in sync with the MySQL binlog")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sync.yaml", env = "SMARTOJ_SYNC_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Inspect or reset the stored binlog position
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored position
    Show,
    /// Forget the stored position; the next run starts at the server's current position
    Clear,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = SyncConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate(&config),
        Commands::Checkpoint { action } => checkpoint(&config.checkpoint, action).await,
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
    }
}

async fn open_store(config: &CheckpointConfig) -> Result<SharedPositionStore> {
    Ok(match config.backend {
        CheckpointBackend::File => Arc::new(
            FilePositionStore::new(&config.dir, &config.key)
                .await
                .context("Failed to open checkpoint store")?,
        ),
        CheckpointBackend::Memory => {
            warn!("Using the in-memory checkpoint store; positions are lost on exit");
            Arc::new(MemoryPositionStore::new())
        }
    })
}

async fn run(config: SyncConfig) -> Result<()> {
    info!(
        "Starting {} for {}:{}/{}",
        config.pipeline.name, config.source.host, config.source.port, config.source.database
    );

    let pool = mysql_async::Pool::new(config.source.pool_opts());
    let store = open_store(&config.checkpoint).await?;

    let index = Arc::new(ElasticsearchIndex::new(&config.index)?);
    if config.index.ensure_index {
        index
            .ensure_index()
            .await
            .context("Failed to prepare the search index")?;
    }
    let handlers = HandlerRegistry::new(
        index,
        Arc::new(MySqlDirectory::new(pool.clone())),
        Arc::new(MySqlNotificationStore::new(pool.clone())),
    );
    let broker = broker::from_config(&config.broker, handlers)?;

    let source = StreamReader::new(
        ReaderConfig::from(&config.source),
        Arc::new(MySqlColumnCatalog::new(pool.clone())),
        pool.clone(),
    );
    let mut pipeline = Pipeline::new(
        Box::new(source),
        store,
        broker,
        ProgressNotifier::new(&config.pipeline.name),
    )
    .with_queue_capacity(config.queue.capacity)
    .with_join_timeout(config.reader_join_timeout())
    .with_pool(pool);

    pipeline.start().await.context("Failed to start pipeline")?;

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, draining");
                stop.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let exit = pipeline.wait().await?;
    info!(
        "Stopped: reader {}, {} batches, {} records, {} skipped",
        exit.reader, exit.stats.batches, exit.stats.records, exit.stats.skipped
    );

    if let Err(e) = exit.dispatcher {
        anyhow::bail!("dispatcher failed [{}]: {}", e.error_code(), e);
    }
    if !exit.reader.is_clean() {
        anyhow::bail!("reader exited: {}", exit.reader);
    }
    Ok(())
}

fn validate(config: &SyncConfig) -> Result<()> {
    println!("✓ Configuration is valid");
    println!(
        "  Source: {}@{}:{}/{} (server_id {})",
        config.source.user,
        config.source.host,
        config.source.port,
        config.source.database,
        config.source.server_id
    );
    println!("  Tables: {}", config.source.tables.join(", "));
    println!("  Queue capacity: {}", config.queue.capacity);
    println!(
        "  Checkpoint: {:?} ({})",
        config.checkpoint.backend,
        config.checkpoint.dir.join(format!("{}.json", config.checkpoint.key)).display()
    );
    println!("  Broker: {:?}", config.broker.kind);
    println!("  Index: {}/{}", config.index.url, config.index.index);
    Ok(())
}

async fn checkpoint(config: &CheckpointConfig, action: CheckpointAction) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        CheckpointAction::Show => match store.load().await? {
            Some(position) => println!(
                "{}",
                serde_json::to_string_pretty(&Checkpoint::from(&position))?
            ),
            None => println!("No checkpoint stored"),
        },
        CheckpointAction::Clear => {
            store.clear().await?;
            println!("Checkpoint cleared");
        }
    }
    Ok(())
}
