//! worldlink-daemon - keeps a link to the world simulator open.
//!
//! Loads the link configuration, connects with the configured fleet, logs a
//! health report periodically, and disconnects cleanly on SIGINT or SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worldlink_core::LinkConfig;
use worldlink_daemon::HealthStatus;
use worldlink_daemon::link::{InMemoryFleet, LinkPhase, SimulatorLink};

/// worldlink daemon
#[derive(Parser, Debug)]
#[command(name = "worldlink-daemon")]
#[command(version, about = "Keeps a fleet link to the world simulator")]
struct Args {
    /// Path to link configuration file
    #[arg(short, long, default_value = "worldlink.toml")]
    config: PathBuf,

    /// World to join; a new world is created when omitted
    #[arg(long)]
    world_id: Option<i64>,

    /// Simulator host (overrides config and environment)
    #[arg(long)]
    host: Option<String>,

    /// Simulator port (overrides config and environment)
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between health reports
    #[arg(long, default_value_t = 30)]
    health_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to log file (logs to stdout when omitted)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(path: &Path, args: &Args) -> Result<LinkConfig> {
    let mut config = if path.exists() {
        LinkConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?
    } else {
        info!(path = %path.display(), "configuration file not found, using defaults");
        LinkConfig::default()
    };

    config
        .apply_env_overrides()
        .context("invalid environment override")?;

    if let Some(host) = &args.host {
        config.simulator.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.simulator.port = port;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args.config, &args)?;
    let trucks = config.initial_fleet();
    info!(
        simulator = %config.simulator.address(),
        trucks = trucks.len(),
        reconnect = config.reconnect.enabled,
        "starting worldlink daemon"
    );

    let fleet = Arc::new(InMemoryFleet::new(trucks.clone()));
    let link = SimulatorLink::new(config, fleet);
    let world_id = link
        .connect(args.world_id, trucks)
        .await
        .context("failed to connect to world simulator")?;
    info!(world_id, "link established");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let mut health_tick = tokio::time::interval(Duration::from_secs(args.health_interval.max(1)));

    let outcome = loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                break Ok(());
            }
            _ = health_tick.tick() => {
                let report = link.check_health().await;
                let rendered = serde_json::to_string(&report).context("failed to render health report")?;
                match report.status {
                    HealthStatus::Up => info!(health = %rendered, "link health"),
                    HealthStatus::NotConnected | HealthStatus::Down => {
                        warn!(health = %rendered, "link health");
                    }
                }
                if report.phase == LinkPhase::Stopped {
                    error!("link stopped after exhausting reconnection attempts");
                    break Err(report.message);
                }
            }
        }
    };

    link.disconnect().await;
    info!("worldlink daemon stopped");

    match outcome {
        Ok(()) => Ok(()),
        Err(message) => bail!("world simulator link stopped: {message}"),
    }
}
