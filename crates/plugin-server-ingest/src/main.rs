//! Plugin server ingestion daemon.
//!
//! Consumes raw events from the configured queue, runs each team's plugin
//! chain, maintains the `posthog_team_eventpropfilter` table and writes
//! processed events and dead letters to their topics.
//!
//! # Usage
//!
//! ```bash
//! # Run with settings from the environment (and ./.env if present)
//! plugin-server
//!
//! # Run the worker pool once; a crash becomes the exit code
//! plugin-server --no-restart-loop
//!
//! # Load a specific env file
//! plugin-server --dotenv /etc/plugin-server/env
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Workers stop pulling new batches
//! 2. The in-flight batch is finished and sinks are flushed
//! 3. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use plugin_server_core::metrics::{init_metrics, metrics_router};
use plugin_server_ingest::health::{HealthRegistry, health_router};
use plugin_server_ingest::plugins::spawn_config_refresher;
use plugin_server_ingest::{
    Config, PluginConfigHandle, PluginConfigSnapshot, PluginExecutor, PluginRegistry,
    PropertyResolver, RestartPolicy, RetryPolicy, SpoolQueue, SqliteStore, TopicWriter,
    WorkerContext, run_pool, supervise,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Plugin server ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "plugin-server")]
#[command(about = "Event ingestion with per-team plugins and property definitions")]
#[command(version)]
struct Args {
    /// Run the worker pool once instead of restarting it after a crash
    #[arg(long)]
    no_restart_loop: bool,

    /// Environment file to load before reading configuration
    #[arg(long, env = "DOTENV_PATH")]
    dotenv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.dotenv {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("plugin_server_ingest=debug".parse()?),
        )
        .init();

    tracing::info!("Plugin server starting...");

    let config = Config::from_env().context("Invalid configuration")?;

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Health and metrics server
    let health = HealthRegistry::new();
    let metrics_handle = init_metrics();
    let app = health_router(health.clone()).merge(metrics_router(metrics_handle));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Health and metrics server listening on {}", config.bind_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Health server stopped: {}", e);
        }
    });

    let ctx = Arc::new(build_context(&config, Arc::clone(&running), health)?);

    tracing::info!("Configuration:");
    tracing::info!("  Queue hosts: {}", config.queue_hosts.len());
    tracing::info!("  Consumer topic: {}", config.consumer_topic);
    tracing::info!("  Database: {}", config.database_path.display());
    tracing::info!("  Workers: {}", config.worker_count);
    tracing::info!("  Restart loop: {}", !args.no_restart_loop);

    let refresher = spawn_config_refresher(
        ctx.plugin_config.clone(),
        config.plugin_config_path.clone(),
        config.config_refresh_interval,
        Arc::clone(&running),
    );

    let policy = if args.no_restart_loop {
        RestartPolicy::once()
    } else {
        RestartPolicy::with_delay(config.restart_delay)
    };

    let workers = config.worker_count;
    let result = supervise(policy, Arc::clone(&running), |attempt| {
        let ctx = Arc::clone(&ctx);
        async move {
            if attempt > 0 {
                tracing::info!(attempt, "Restarting worker pool");
            }
            run_pool(ctx, workers).await
        }
    })
    .await;

    // Shutdown sequence
    tracing::info!("Shutting down...");
    running.store(false, Ordering::SeqCst);
    refresher.abort();

    let stats = result.context("Worker pool failed")?;

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Messages received:    {}", stats.received);
    tracing::info!("Events forwarded:     {}", stats.forwarded);
    tracing::info!("Events dropped:       {}", stats.dropped);
    tracing::info!("Dead letters:         {}", stats.dead_lettered);
    tracing::info!("Plugin failures:      {}", stats.plugin_failures);

    Ok(())
}

/// Open the store, queue, sinks and plugin config.
fn build_context(
    config: &Config,
    running: Arc<AtomicBool>,
    health: HealthRegistry,
) -> Result<WorkerContext> {
    tracing::info!("Opening property store at {}", config.database_path.display());
    let store = Arc::new(
        SqliteStore::open(&config.database_path).with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?,
    );

    let snapshot = PluginConfigSnapshot::load(&config.plugin_config_path)
        .context("Failed to load plugin config")?;
    tracing::info!("Loaded plugin config for {} teams", snapshot.team_count());

    let queue = Arc::new(
        SpoolQueue::open(&config.queue_hosts, &config.consumer_topic)
            .context("Failed to open consumer topic")?,
    );

    let output_root = config
        .queue_hosts
        .first()
        .context("No queue host for output topics")?;
    let sink = Arc::new(TopicWriter::open(output_root, &config.producer_topic)?);
    let dead_letters = Arc::new(TopicWriter::open(output_root, &config.dead_letter_topic)?);

    let registry = PluginRegistry::with_builtins();
    tracing::info!("Registered plugins: {}", registry.ids().join(", "));

    Ok(WorkerContext {
        queue,
        plugin_config: PluginConfigHandle::new(snapshot),
        executor: PluginExecutor::new(Arc::new(registry), config.plugin_timeout),
        resolver: PropertyResolver::new(store),
        retry: RetryPolicy {
            max_attempts: config.persist_max_attempts,
            base_delay: config.persist_retry_delay,
            max_jitter: Duration::from_millis(50),
        },
        sink,
        dead_letters,
        batch_size: config.batch_size,
        poll_timeout: config.poll_timeout,
        running,
        health,
    })
}
