//! WebHooks Sender
//!
//! Runs the delivery engine against a file-backed registration store:
//! - Loads `webhooks.toml` (or `--config`) with `WEBHOOKS_*` overrides
//! - Submits an optional batch file of notifications
//! - Runs the policy sweeper in the background
//! - Drains in-flight deliveries on Ctrl+C / SIGTERM

mod batch;
mod file_store;
mod gone;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wh_config::{AppConfig, ConfigLoader};
use wh_sender::{
    DispatcherConfig, PolicyConfig, PolicyRegistry, PolicySweeper, RegistrationStore,
    SweeperConfig, WebhookDispatcher,
};

use crate::file_store::FileRegistrationStore;
use crate::gone::DisableOnGone;

#[derive(Parser, Debug)]
#[command(name = "wh-sender")]
#[command(about = "WebHooks Sender - signed webhook delivery with retries and circuit breaking")]
struct Args {
    /// Config file path (defaults to the standard search paths)
    #[arg(long, env = "WEBHOOKS_CONFIG")]
    config: Option<PathBuf>,

    /// JSON batch of notifications to submit on startup
    #[arg(long, env = "WEBHOOKS_BATCH")]
    batch: Option<PathBuf>,

    /// Exit once the submitted batch has been fully processed
    #[arg(long, default_value = "false")]
    once: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    if args.print_config {
        println!("{}", AppConfig::example_toml());
        return Ok(());
    }

    wh_common::logging::init_logging("wh-sender");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    info!(
        concurrency = config.dispatcher.concurrency,
        max_retries = config.retry.max_retries,
        backoff = ?config.retry.backoff,
        failure_threshold = config.circuit_breaker.failure_threshold,
        cooldown_secs = config.circuit_breaker.cooldown_secs,
        "Starting WebHooks Sender"
    );

    // 1. Registration store and policy registry
    let file_store = Arc::new(FileRegistrationStore::new(&config.store.registrations_path));
    info!(path = %file_store.path().display(), "Using file registration store");
    let store: Arc<dyn RegistrationStore> = file_store;
    let registry = Arc::new(PolicyRegistry::new(PolicyConfig::from(&config.circuit_breaker)));

    // 2. Dispatcher
    let dispatcher = WebhookDispatcher::new(
        DispatcherConfig::from(&config),
        Arc::clone(&registry),
        Arc::new(DisableOnGone::new(Arc::clone(&store))),
    )?;

    // 3. Sweeper
    let shutdown = CancellationToken::new();
    let sweeper_handle = if config.sweeper.enabled {
        let sweeper = Arc::new(PolicySweeper::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            SweeperConfig::from(&config.sweeper),
        ));
        Some(sweeper.spawn(shutdown.clone()))
    } else {
        info!("Policy sweeper disabled");
        None
    };

    // 4. Initial batch
    if let Some(path) = &args.batch {
        let entries = batch::load_entries(path).await?;
        let destinations = store.list_destinations().await?;
        let items = batch::into_work_items(entries, destinations)?;
        info!(count = items.len(), path = %path.display(), "Submitting batch");
        dispatcher.submit(items)?;
    }

    if args.once {
        tokio::select! {
            _ = wait_until_idle(&dispatcher) => info!("Batch processed"),
            _ = shutdown_signal() => info!("Shutdown signal received..."),
        }
    } else {
        info!("WebHooks Sender started. Press Ctrl+C to shutdown.");
        shutdown_signal().await;
        info!("Shutdown signal received...");
    }

    // Graceful shutdown
    shutdown.cancel();
    dispatcher.shutdown().await;

    if let Some(handle) = sweeper_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Sweeper task failed"),
            Err(_) => warn!("Sweeper did not stop within 5s"),
        }
    }

    let stats = dispatcher.stats();
    info!(
        submitted = stats.submitted,
        delivered = stats.delivered,
        gone = stats.gone,
        failed = stats.failed,
        abandoned = stats.abandoned,
        skipped = stats.skipped,
        "WebHooks Sender shutdown complete"
    );

    Ok(())
}

async fn wait_until_idle(dispatcher: &WebhookDispatcher) {
    while !dispatcher.wait_idle(Duration::from_secs(60)).await {
        info!(in_flight = dispatcher.stats().in_flight, "Still delivering");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
