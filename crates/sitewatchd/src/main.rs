//! Sitewatch daemon - HTTP outage tracker
//!
//! Probes every configured site, persists outage state across runs, and
//! collects a diagnostic snapshot for each resolved outage.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sitewatch_common::config::ConfigOrigin;
use sitewatch_common::journal::Journal;
use sitewatch_common::sites::is_valid_site_name;
use sitewatch_common::timefmt::{format_timestamp, now_local, parse_timestamp};
use sitewatch_common::{Config, FileStateStore, OutageInterval, SnapshotEngine, SnapshotTarget, StateStore};
use sitewatchd::cli::{Cli, Commands};
use sitewatchd::daemon;
use sitewatchd::dispatch::{ProcessDispatcher, SnapshotJob};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, origin) = match &cli.config {
        Some(path) => (
            Config::load_from_path(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            ConfigOrigin::File(path.clone()),
        ),
        None => Config::load(),
    };

    // Status is read-only and should not append to the service log
    let log_file = match cli.command {
        Commands::Status { .. } => None,
        _ => Some(config.self_log_path()),
    };
    if let Some(err) = sitewatchd::logging::init(log_file.as_deref()) {
        warn!("Log file unavailable, logging to stderr only: {}", err);
    }
    match &origin {
        ConfigOrigin::File(path) => info!("Loaded config from {}", path.display()),
        ConfigOrigin::Defaults(err) => warn!("Using default config ({})", err),
    }

    match cli.command {
        Commands::Tick => {
            let dispatcher = ProcessDispatcher::current_exe(cli.config.clone())?;
            let tracker = daemon::build_tracker(&config, Arc::new(dispatcher))?;
            daemon::run_tick(&config, &tracker).await?;
        }
        Commands::Run => {
            info!("sitewatchd v{} starting", env!("CARGO_PKG_VERSION"));
            daemon::run_loop(config).await?;
        }
        Commands::Snapshot {
            site,
            runtime,
            root,
            start,
            end,
        } => {
            let location = snapshot(&config, site, runtime, root, &start, &end).await?;
            println!("{}", location.display());
        }
        Commands::Status { recent } => status(&config, recent)?,
    }

    Ok(())
}

async fn snapshot(
    config: &Config,
    site: String,
    runtime: String,
    root: PathBuf,
    start: &str,
    end: &str,
) -> Result<PathBuf> {
    if !is_valid_site_name(&site) {
        bail!("invalid site name '{}'", site);
    }
    let started_at = parse_timestamp(start)?;
    let ended_at = parse_timestamp(end)?;
    let job = SnapshotJob {
        interval: OutageInterval::new(&site, started_at, ended_at)?,
        target: SnapshotTarget {
            site,
            runtime_version: runtime,
            root_path: root,
        },
    };

    let engine = SnapshotEngine::from_config(config);
    let runner = daemon::snapshot_runner(config);
    let report = tokio::task::spawn_blocking(move || runner.run(&engine, &job))
        .await
        .context("snapshot task")??;
    Ok(report.report_dir)
}

fn status(config: &Config, recent: usize) -> Result<()> {
    let store = FileStateStore::new(config.state_dir.clone());
    let active = store.list_active().context("reading outage state")?;
    let now = now_local();

    if active.is_empty() {
        println!("No active outages");
    } else {
        println!("Active outages:");
        for state in &active {
            println!(
                "  {:<24} down since {} ({}s)",
                state.site,
                format_timestamp(&state.started_at),
                (now - state.started_at).num_seconds().max(0)
            );
        }
    }

    let entries = Journal::new(config.journal_path()).read_recent(recent);
    if !entries.is_empty() {
        println!();
        println!("Recent transitions:");
        for entry in entries {
            println!("  {}", entry.to_log_line());
        }
    }
    Ok(())
}
