//! hostbald — the hostbal daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Load balancer (detection, balancing, consolidation ticks)
//! - Standalone collaborators (rule filter, simulated executor, power)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! hostbald run --config /etc/hostbal/hostbal.toml --data-dir /var/lib/hostbal --port 8780
//! hostbald check-config --config /etc/hostbal/hostbal.toml
//! ```

mod config;
mod standalone;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use hostbal_engine::{Collaborators, LoadBalancer, PowerControl};
use hostbal_state::StateStore;

use crate::config::DaemonConfig;
use crate::standalone::{CommandPower, RuleFilter, SimulatedExecutor, SimulatedPower};

#[derive(Parser)]
#[command(name = "hostbald", about = "hostbal fleet load balancer daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the balancing loop and the REST API.
    Run {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/hostbal")]
        data_dir: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8780")]
        port: u16,

        /// Log power actions instead of running the `[power]` commands.
        #[arg(long)]
        standalone_sim: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostbald=debug,hostbal=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            standalone_sim,
        } => run(config, data_dir, port, standalone_sim).await,
        Command::CheckConfig { config } => check_config(config),
    }
}

fn collaborators(
    store: &StateStore,
    config: &DaemonConfig,
    simulate_power: bool,
) -> anyhow::Result<Collaborators> {
    let power: Arc<dyn PowerControl> = if simulate_power {
        Arc::new(SimulatedPower)
    } else {
        Arc::new(CommandPower::new(config.power.clone())?)
    };
    Ok(Collaborators {
        placement: Arc::new(RuleFilter),
        executor: Arc::new(SimulatedExecutor::new(store.clone())),
        power,
    })
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::load(Some(&path))?;
    let store = StateStore::open_in_memory()?;
    let simulate_power = !config.power.is_configured();
    LoadBalancer::new(
        config.balancer.clone(),
        store.clone(),
        collaborators(&store, &config, simulate_power)?,
    )?;

    println!("{}", config.balancer.to_toml_string()?);
    if simulate_power {
        println!("# [power] not configured; only --standalone-sim runs are possible");
    }
    Ok(())
}

async fn run(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    port: u16,
    standalone_sim: bool,
) -> anyhow::Result<()> {
    info!("hostbal daemon starting");

    let config = DaemonConfig::load(config_path.as_deref())?;
    let intervals = config.balancer.intervals.parse()?;

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("hostbal.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let collaborators = collaborators(&store, &config, standalone_sim)?;
    let lb = Arc::new(LoadBalancer::new(
        config.balancer.clone(),
        store,
        collaborators,
    )?);
    info!(simulated_power = standalone_sim, "load balancer initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let ticks_handle = tokio::spawn(lb.clone().run(intervals, shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = hostbal_api::build_router(lb);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = ticks_handle.await;

    info!("hostbal daemon stopped");
    Ok(())
}
