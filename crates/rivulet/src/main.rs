//! rivulet - change data capture for SQL Server
//!
//! # Usage
//!
//! ```bash
//! # Stream changes until Ctrl+C / SIGTERM
//! rivulet -c rivulet.yaml
//!
//! # Validate configuration
//! rivulet -c rivulet.yaml validate
//!
//! # Show columns and stored cursors of the configured tables
//! rivulet -c rivulet.yaml tables
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivulet::config::{CheckpointConfig, RivuletConfig};
use rivulet::app;

#[derive(Parser)]
#[command(name = "rivulet")]
#[command(version, about = "Poll-based change data capture for SQL Server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rivulet.yaml")]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream changes of all configured tables (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Show columns and stored cursors of the configured tables
    Tables,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = RivuletConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
        Commands::Tables => show_tables(&config).await,
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
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn run(config: RivuletConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        stopper.cancel();
    });

    let report = app::run(&config, cancel).await?;

    info!(
        started = report.tables_started.len(),
        skipped = report.tables_skipped.len(),
        failed = report.tables_failed.len(),
        delivered = report.events_delivered,
        publish_failures = report.publish_failures,
        undelivered = report.undelivered,
        "Shutdown complete"
    );
    if !report.tables_failed.is_empty() {
        warn!(tables = ?report.tables_failed, "Some tables stopped with errors");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received shutdown signal (Ctrl+C)"),
        _ = terminate => info!("Received shutdown signal (SIGTERM)"),
    }
}

fn validate_config(config: &RivuletConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    println!("  Type: {}", config.source.kind());
    println!("  Connection: {}", config.source.redacted());
    println!();

    println!("Checkpoints:");
    match &config.checkpoint {
        CheckpointConfig::Source => println!("  Source database (dbo.cdc_offsets)"),
        CheckpointConfig::File { dir } => println!("  Files under {}", dir.display()),
    }
    println!();

    println!("Publisher:");
    println!(
        "  {:?} ({:?})",
        config.publisher.kind, config.publisher.format
    );
    println!();

    println!("Delivery:");
    match config.delivery.channel_capacity {
        Some(capacity) => println!("  Channel capacity: {}", capacity),
        None => println!("  Channel capacity: unbounded"),
    }
    match config.delivery.drain_timeout {
        Some(timeout) => println!("  Drain timeout: {:?}", timeout),
        None => println!("  Drain timeout: none (full drain)"),
    }
    println!();

    println!("Tables ({}):", config.tables.len());
    for table in &config.tables {
        let batch = table
            .max_batch_size
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string());
        println!(
            "  - {} (poll {:?}..{:?}, batch {})",
            table.table_id()?,
            table.poll_interval(),
            table.max_poll_interval(),
            batch
        );
    }

    Ok(())
}

async fn show_tables(config: &RivuletConfig) -> Result<()> {
    let connector = app::build_connector(config)?;
    let infos = app::inspect_tables(connector, config).await?;

    println!("{:<40} {:<8} {:<44} STATUS", "TABLE", "COLUMNS", "CURSOR");
    for info in &infos {
        let cursor = info
            .cursor
            .as_ref()
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let status = info.error.as_deref().unwrap_or("ok");
        println!(
            "{:<40} {:<8} {:<44} {}",
            info.table.to_string(),
            info.columns.len(),
            cursor,
            status
        );
    }

    let failed = infos.iter().filter(|i| i.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} tables are not ready", failed, infos.len());
    }
    Ok(())
}
