//! searchgridd — the SearchGrid daemon.
//!
//! Single binary that assembles the controller subsystems:
//! - State store (redb)
//! - Node registry
//! - Storage ledger + capacity rebalancer loop
//! - Task lifecycle + scheduler loop (bulk task creation, partition roll)
//!
//! Heartbeat ingestion and task dispatch are carried by an external
//! transport; this process owns the authoritative state and the periodic
//! control loops.
//!
//! # Usage
//!
//! ```text
//! searchgridd run --data-dir /var/lib/searchgrid
//! ```

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use searchgrid_ledger::StorageLedger;
use searchgrid_lifecycle::TaskLifecycle;
use searchgrid_registry::NodeRegistry;
use searchgrid_rebalance::Rebalancer;
use searchgrid_state::TaskType;

#[derive(Parser)]
#[command(name = "searchgridd", about = "SearchGrid capacity controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller loops.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/searchgrid")]
        data_dir: PathBuf,

        /// Rebalancer tick interval in seconds.
        #[arg(long, default_value = "60")]
        rebalance_interval: u64,

        /// Task scheduler tick interval in seconds.
        #[arg(long, default_value = "30")]
        schedule_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,searchgridd=debug,searchgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            rebalance_interval,
            schedule_interval,
        } => run(data_dir, rebalance_interval, schedule_interval).await,
    }
}

async fn run(
    data_dir: PathBuf,
    rebalance_interval: u64,
    schedule_interval: u64,
) -> anyhow::Result<()> {
    info!("SearchGrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("searchgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = searchgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = NodeRegistry::new(state.clone());
    info!("node registry initialized");

    let ledger = StorageLedger::new(state.clone());
    let rebalancer = Rebalancer::new(state.clone(), registry, ledger)?;
    info!(interval = rebalance_interval, "rebalancer initialized");

    let lifecycle = TaskLifecycle::new(state.clone());
    info!(interval = schedule_interval, "task lifecycle initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rebalance_shutdown = shutdown_rx.clone();
    let mut schedule_shutdown = shutdown_rx;

    // ── Start background loops ─────────────────────────────────

    let rebalance_handle = tokio::spawn(async move {
        rebalancer
            .run(Duration::from_secs(rebalance_interval), rebalance_shutdown)
            .await;
    });

    // Scheduler loop: bulk task creation plus partition roll-over.
    let schedule_handle = tokio::spawn(async move {
        info!(interval_secs = schedule_interval, "task scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(schedule_interval)) => {
                    let now = epoch_secs();
                    for task_type in [TaskType::IndexRepo, TaskType::DeleteRepo] {
                        if let Err(e) = lifecycle.create_bulk_tasks(task_type, now) {
                            error!(?task_type, error = %e, "bulk task creation failed");
                        }
                    }
                    if let Err(e) = lifecycle.advance_partitions(now) {
                        error!(error = %e, "partition roll failed");
                    }
                }
                _ = schedule_shutdown.changed() => {
                    info!("task scheduler shutting down");
                    break;
                }
            }
        }
    });

    // ── Graceful shutdown on Ctrl-C ────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = rebalance_handle.await;
    let _ = schedule_handle.await;

    info!("SearchGrid daemon stopped");
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
