//! # Dripflow — Drip-Sequence Scheduling Engine
//!
//! Runs the dispatcher loop that fires due broadcasts, advances
//! per-lead sequences and delivers scheduled messages, plus the
//! periodic enrollment sweep.
//!
//! Usage:
//!   dripflow                         # Run with ~/.dripflow/config.toml
//!   dripflow --config ./drip.toml    # Custom config
//!   dripflow --init-config           # Write a default config and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dripflow_core::DripflowConfig;
use dripflow_engine::{Dispatcher, Enroller, spawn_dispatcher, spawn_enrollment_sweep};
use dripflow_gateway::TelegramGateway;
use dripflow_state::{MemoryState, SharedState};
use dripflow_store::Store;

#[derive(Parser)]
#[command(
    name = "dripflow",
    version,
    about = "💧 Dripflow — drip-sequence scheduling and delivery engine"
)]
struct Cli {
    /// Path to config file (default: ~/.dripflow/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Write a default config to ~/.dripflow/config.toml and exit
    #[arg(long)]
    init_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "dripflow=debug,dripflow_engine=debug,dripflow_store=debug"
    } else {
        "dripflow=info,dripflow_engine=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // --init-config: write defaults and exit
    if cli.init_config {
        let config = DripflowConfig::default();
        config.save()?;
        println!("✅ Wrote default config to {}", DripflowConfig::default_path().display());
        return Ok(());
    }

    // Load config
    let mut config = match &cli.config {
        Some(path) => DripflowConfig::load_from(path)?,
        None => DripflowConfig::load()?,
    };
    if let Some(db_path) = cli.db_path {
        config.store.db_path = db_path;
    }

    // Open the durable store
    let db_path = config.store.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&db_path)?);

    println!("💧 Dripflow v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:    {}", db_path.display());
    println!("   ⏰ Tick:        every {}s", config.dispatcher.tick_secs);
    println!("   📦 Batch size:  {}", config.dispatcher.batch_size);
    println!("   🔁 Retries:     {} (backoff {}s)", config.retry.max_attempts, config.retry.initial_backoff_secs);
    println!("   📡 Telegram:    {}", config.telegram.api_base);
    println!();

    // Shared coordination state and the delivery gateway
    let state: Arc<dyn SharedState> = Arc::new(MemoryState::new());
    let gateway = Arc::new(TelegramGateway::new(&config.telegram.api_base));

    // Dispatcher loop
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        state,
        gateway,
        config.dispatcher.clone(),
        config.retry.clone(),
    ));
    let dispatcher_handle = spawn_dispatcher(dispatcher);

    // Enrollment sweep
    let enroller = Arc::new(Enroller::new(store));
    let sweep_handle = spawn_enrollment_sweep(enroller, config.dispatcher.enroll_sweep_secs);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
        _ = dispatcher_handle => {
            tracing::error!("Dispatcher loop exited unexpectedly");
        }
        _ = sweep_handle => {
            tracing::error!("Enrollment sweep exited unexpectedly");
        }
    }

    Ok(())
}
