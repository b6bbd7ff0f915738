use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reaper_kernel::adapters::metadata::HttpMetadataClient;
use reaper_kernel::config::ReaperConfig;
use reaper_kernel::liveness::LivenessGuard;
use reaper_kernel::sweep::{SweepReport, Sweeper};

/// Reaper partition garbage collector
#[derive(Parser, Debug)]
#[command(name = "reaper")]
#[command(about = "Retire partitions no longer assigned to this node", long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to ./reaper.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Metadata service host
    #[arg(long)]
    host: Option<String>,

    /// Metadata service HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Node data root
    #[arg(long)]
    node_dir: Option<PathBuf>,

    /// Quarantine root for retired partitions
    #[arg(long)]
    dest_dir: Option<PathBuf>,

    /// Tables swept concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Metadata query timeout, e.g. `5s`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Delete orphans in place instead of quarantining them
    #[arg(long)]
    no_quarantine: bool,

    /// Report what would be retired without touching the disk
    #[arg(long)]
    dry_run: bool,

    /// Do not check for processes holding partition files open
    #[arg(long)]
    skip_liveness_check: bool,

    /// Repeat the sweep on this interval until interrupted, e.g. `10m`
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
}

impl Cli {
    /// Command-line flags take precedence over file and environment.
    fn apply(&self, config: &mut ReaperConfig) {
        if let Some(host) = &self.host {
            config.metadata.host = host.clone();
        }
        if let Some(port) = self.port {
            config.metadata.port = port;
        }
        if let Some(node_dir) = &self.node_dir {
            config.node_dir = node_dir.clone();
        }
        if let Some(dest_dir) = &self.dest_dir {
            config.dest_dir = dest_dir.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.metadata.query_timeout = timeout;
        }
        if self.no_quarantine {
            config.quarantine = false;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.skip_liveness_check {
            config.liveness.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the JSON report.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load configuration
    // ----------------------------
    let mut config = ReaperConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    // ----------------------------
    // Wire components
    // ----------------------------
    let metadata =
        HttpMetadataClient::new(&config.metadata).context("failed to build metadata client")?;
    info!(url = metadata.url(), "using metadata service");
    let guard = LivenessGuard::from_config(&config.liveness);
    let sweeper = Sweeper::new(&config, metadata, guard);

    // ----------------------------
    // Sweep
    // ----------------------------
    match cli.interval {
        None => {
            let report = sweeper.run().await?;
            print_report(&report)?;
        }
        Some(interval) => run_every(&sweeper, interval).await?,
    }

    Ok(())
}

async fn run_every(sweeper: &Sweeper<HttpMetadataClient>, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweeper.run().await?;
                print_report(&report)?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("interrupted, stopping");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &SweepReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
