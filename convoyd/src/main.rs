//! Convoy daemon entry point.
//!
//! Wires the store, registry and controller together, then runs the two
//! transport listeners until a shutdown signal arrives. The controller is
//! constructed here and handed to the transports explicitly; nothing in the
//! core reaches for global state.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use convoy_common::types::{DEFAULT_CHECKPOINT_ADDR, DEFAULT_NOTIFY_ADDR};
use convoyd::config;
use convoyd::controller::Controller;
use convoyd::egress::spawn_notification_listener;
use convoyd::ingress::spawn_checkpoint_listener;
use convoyd::registry::Registry;
use convoyd::store::{JsonStore, RelationalStore};

const DEFAULT_DATA_DIR: &str = "/tmp/convoyd";

#[derive(Parser, Debug)]
#[command(name = "convoyd", version = "0.1.0")]
#[command(about = "Convoy job coordination daemon")]
struct Cli {
    /// Address of the checkpoint ingress listener
    #[arg(long)]
    checkpoint_addr: Option<String>,

    /// Address of the notification egress listener
    #[arg(long)]
    notify_addr: Option<String>,

    /// Controller snapshot file (defaults to <data-dir>/controller.snapshot.json)
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Directory for the relational store files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the daemon configuration (convoyd.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CONVOYD_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join("convoyd.toml");
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        });
    let settings = config::load_settings(config_path.as_deref());

    let data_dir = cli
        .data_dir
        .or(settings.data_dir)
        .or_else(|| std::env::var("CONVOYD_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let snapshot_path = cli
        .snapshot
        .or(settings.snapshot_path)
        .unwrap_or_else(|| data_dir.join("controller.snapshot.json"));
    let checkpoint_addr = cli
        .checkpoint_addr
        .or(settings.checkpoint_addr)
        .unwrap_or_else(|| DEFAULT_CHECKPOINT_ADDR.to_string());
    let notify_addr = cli
        .notify_addr
        .or(settings.notify_addr)
        .unwrap_or_else(|| DEFAULT_NOTIFY_ADDR.to_string());

    let store: Arc<JsonStore> = Arc::new(
        JsonStore::open(&data_dir)
            .with_context(|| format!("failed to open store at {}", data_dir.display()))?,
    );
    let registry = Arc::new(Registry::new());
    match store.load_all_requests() {
        Ok(requests) => {
            info!(count = requests.len(), "Request table seeded from store");
            registry.seed_requests(requests);
        }
        Err(err) => warn!("Failed to load requests from store: {}", err),
    }

    let controller = Arc::new(Controller::new(
        registry.clone(),
        store.clone(),
        &snapshot_path,
    ));

    let checkpoint_listener = TcpListener::bind(&checkpoint_addr)
        .await
        .with_context(|| format!("failed to bind checkpoint listener on {checkpoint_addr}"))?;
    info!("Checkpoint ingress listening on {}", checkpoint_addr);
    let notify_listener = TcpListener::bind(&notify_addr)
        .await
        .with_context(|| format!("failed to bind notification listener on {notify_addr}"))?;
    info!("Notification egress listening on {}", notify_addr);

    spawn_checkpoint_listener(checkpoint_listener, controller.clone());
    spawn_notification_listener(notify_listener, registry.clone());

    wait_for_shutdown().await;

    let pending = controller.pending_jobs().await.len();
    let in_progress = controller.get_in_progress_jobs().await.len();
    info!(
        pending_jobs = pending,
        in_progress_jobs = in_progress,
        "Graceful shutdown; in-flight connections are not forcibly closed"
    );
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                let _ = signal::ctrl_c().await;
                info!("Received Ctrl+C; shutting down daemon");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down daemon"),
            _ = sigterm.recv() => info!("Received SIGTERM; shutting down daemon"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C; shutting down daemon");
    }
}
