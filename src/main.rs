// ABOUTME: CLI entry point for change-router
// ABOUTME: Parses commands and routes to the engine API

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use change_router::batch::{BatchStatus, TransitionDetail};
use change_router::config::EngineConfig;
use change_router::routing::RouterSet;
use change_router::utils::expand_home;
use change_router::RoutingEngine;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "change-router")]
#[command(about = "Routes captured database changes into per-node batches", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to change-router.toml (defaults to ~/.change-router/change-router.toml)
    #[arg(long, global = true, env = "CHANGE_ROUTER_CONFIG")]
    config: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "CHANGE_ROUTER_LOG", default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route captured changes into batches
    Route {
        /// Run a single pass over every channel and exit
        #[arg(long)]
        once: bool,
    },
    /// List outgoing batches for a node
    Batches {
        #[arg(long)]
        node: String,
        /// Only batches in this status (NE, QY, SE, LD, OK, ER, IG); default is undelivered
        #[arg(long)]
        status: Option<String>,
    },
    /// Record a status reported by the transport for an outgoing batch
    BatchStatus {
        #[arg(long)]
        node: String,
        #[arg(long)]
        batch: i64,
        #[arg(long)]
        status: String,
        /// Error detail to store with the batch
        #[arg(long)]
        error: Option<String>,
        /// Count this report as a retry
        #[arg(long)]
        retry: bool,
    },
    /// Show the open gaps of a channel
    Gaps {
        #[arg(long)]
        channel: String,
    },
    /// Validate the configuration and compile every router
    CheckConfig,
}

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = match path {
        Some(path) => expand_home(&path),
        None => EngineConfig::default_path()?,
    };
    let mut config = EngineConfig::load(&path)?;
    config.engine.database = expand_home(&config.engine.database);
    tracing::debug!(config = %path.display(), db = %config.engine.database.display(), "loaded configuration");
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Route { once } => route(config, once).await,
        Commands::Batches { node, status } => {
            let engine = RoutingEngine::new(config)?;
            let batches = match status {
                Some(status) => {
                    let status: BatchStatus = status.parse()?;
                    engine.find_batches(&node, Some(status))?
                }
                None => engine.list_sealed_batches(&node)?,
            };
            if batches.is_empty() {
                println!("No batches for node {}", node);
            }
            for batch in batches {
                println!(
                    "{:>8}  {:<12} {}  events={:<6} bytes={:<8} retries={}{}",
                    batch.batch_id,
                    batch.channel_id,
                    batch.status,
                    batch.event_count,
                    batch.byte_count,
                    batch.retry_count,
                    batch
                        .error_detail
                        .map(|e| format!("  error={e}"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::BatchStatus {
            node,
            batch,
            status,
            error,
            retry,
        } => {
            let engine = RoutingEngine::new(config)?;
            let status: BatchStatus = status.parse()?;
            let detail = TransitionDetail {
                error,
                increment_retry: retry,
                stats: None,
            };
            let updated = engine
                .report_batch_status(&node, batch, status, &detail)
                .with_context(|| format!("Failed to update batch {node}-{batch}"))?;
            println!(
                "Batch {}-{} is now {} (retries: {})",
                updated.node_id, updated.batch_id, updated.status, updated.retry_count
            );
            Ok(())
        }
        Commands::Gaps { channel } => {
            if config.channel(&channel).is_none() {
                bail!("channel '{}' is not configured", channel);
            }
            let engine = RoutingEngine::new(config)?;
            match engine.gaps(&channel)? {
                None => println!("Channel {} has not been routed yet", channel),
                Some(snapshot) => {
                    println!(
                        "Channel {} (checkpoint v{}, max seen id {})",
                        channel, snapshot.version, snapshot.max_seen_id
                    );
                    for gap in &snapshot.gaps {
                        println!("  {}", gap);
                    }
                }
            }
            Ok(())
        }
    }
}

fn check_config(config: &EngineConfig) -> Result<()> {
    let routers = RouterSet::compile(&config.routers);
    println!("Configuration fingerprint: {}", config.fingerprint());
    println!("  Node:     {}", config.engine.node_id);
    println!("  Database: {}", config.engine.database.display());
    println!("  Channels: {}", config.channels.len());
    println!("  Routers:  {} compiled", routers.rules().len());
    for (router_id, err) in routers.rejected() {
        println!("  ✗ router {}: {}", router_id, err);
    }
    if !routers.rejected().is_empty() {
        bail!("{} router(s) failed to compile", routers.rejected().len());
    }
    println!("✓ Configuration is valid");
    Ok(())
}

async fn route(config: EngineConfig, once: bool) -> Result<()> {
    let engine = RoutingEngine::new(config)?;

    if once {
        let passes = engine.route_all().await?;
        for pass in &passes {
            if pass.lock_skipped {
                println!("{}: skipped (locked by another instance)", pass.channel_id);
                continue;
            }
            println!(
                "{}: read {} routed {} unrouted {} batches {} open gaps {}",
                pass.channel_id,
                pass.counters.rows_read,
                pass.counters.rows_routed,
                pass.counters.rows_unrouted,
                pass.counters.batches_sealed,
                pass.gaps_open
            );
        }
        let failed: Vec<_> = engine
            .statistics()
            .into_iter()
            .filter(|s| !s.is_success())
            .collect();
        for stats in &failed {
            println!(
                "{}: failed: {}",
                stats.channel_id,
                stats.last_error.as_deref().unwrap_or("flagged")
            );
        }
        if !failed.is_empty() {
            bail!("{} channel(s) failed to route", failed.len());
        }
        return Ok(());
    }

    tracing::info!("Starting routing engine...");
    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    engine.run(shutdown_rx).await?;
    Ok(())
}
