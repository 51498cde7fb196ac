//! Tagwatch Service - keeps registered tracker tags connected.
//!
//! Run with: `cargo run -p tagwatch-service`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tagwatch_core::{
    BtleplugRadio, ConnectionCoordinator, FixedLocation, MemoryRemoteRegistry, MemoryStore,
};
use tagwatch_service::{Config, default_config_path, log_events};

/// Tagwatch Service - headless BLE tracker tag daemon.
#[derive(Parser, Debug)]
#[command(name = "tagwatch-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive (overrides the default, e.g. `tagwatch_core=debug`).
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// User id (overrides config).
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Also print every event to stdout as a JSON line.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Load and validate the configuration, then exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    match args.command {
        Some(Command::Init { force }) => init_config(args.config, force),
        Some(Command::Check) => check_config(args.config),
        Some(Command::Run) | None => run_service(args).await,
    }
}

fn init_logging(directive: Option<&str>) -> anyhow::Result<()> {
    let filter = match directive {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::from_default_env()
            .add_directive("tagwatch_core=info".parse()?)
            .add_directive("tagwatch_service=info".parse()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(default_config_path);
    let config = Config::load_validated(&path)?;
    println!(
        "{} is valid ({} device(s), user '{}')",
        path.display(),
        config.devices.len(),
        config.user_id
    );
    Ok(())
}

async fn run_service(args: Args) -> anyhow::Result<()> {
    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };

    // Override config with CLI args
    if let Some(user) = args.user {
        config.user_id = user;
    }
    config.validate()?;
    if config.user_id.is_empty() {
        warn!("No user_id configured; shared tags will not auto-connect");
    }

    let remote = Arc::new(MemoryRemoteRegistry::new(config.devices.clone()));
    remote.set_latest_firmware(config.latest_firmware).await;
    let store = Arc::new(MemoryStore::new());

    let radio = Arc::new(BtleplugRadio::new().await?);
    let coordinator = Arc::new(ConnectionCoordinator::new(
        radio,
        remote,
        store.clone(),
        Arc::new(FixedLocation(config.location)),
        config.coordinator_config(),
    )?);
    coordinator.set_policy(config.policy).await?;

    let cancel = CancellationToken::new();
    let log_cancel = CancellationToken::new();
    let logger = tokio::spawn(log_events(
        coordinator.events().subscribe(),
        args.json,
        log_cancel.clone(),
    ));
    let task = coordinator.start(cancel.clone());
    info!(
        "Watching {} registered tag(s) as '{}'",
        config.devices.len(),
        config.user_id
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    cancel.cancel();
    if let Err(e) = task.await {
        warn!("Coordinator task failed: {}", e);
    }
    coordinator.shutdown().await;
    // Let the logger drain what shutdown emitted before stopping it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    log_cancel.cancel();
    let _ = logger.await;

    debug!("Final device records:\n{}", store.snapshot_json().await?);
    Ok(())
}
