//! Tick scheduling
//!
//! `run_tick` is one scheduler pass; `run_loop` repeats it on a fixed period
//! until ctrl-c, then waits for in-flight snapshots.

use crate::dispatch::{ChannelDispatcher, SnapshotDispatch, SnapshotRunner};
use crate::probe::{HttpProber, Prober};
use crate::tracker::{TickReport, Tracker};
use anyhow::{Context, Result};
use sitewatch_common::journal::Journal;
use sitewatch_common::{load_sites, Config, FileStateStore, SnapshotEngine, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Load the site list and evaluate one tick. Only an unreadable site list fails.
pub async fn run_tick(config: &Config, tracker: &Tracker) -> Result<TickReport> {
    let list = load_sites(&config.sites_file).context("loading site list")?;
    Ok(tracker.evaluate_tick(&list.sites).await)
}

/// Tracker wired to the file store and HTTP prober
pub fn build_tracker(config: &Config, dispatcher: Arc<dyn SnapshotDispatch>) -> Result<Tracker> {
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_dir.clone()));
    let prober: Arc<dyn Prober> = Arc::new(
        HttpProber::new(Duration::from_secs(config.probe_timeout_secs))
            .context("building HTTP client")?,
    );
    Ok(Tracker::from_config(config, store, prober, dispatcher))
}

pub fn snapshot_runner(config: &Config) -> SnapshotRunner {
    SnapshotRunner {
        lock_dir: config.state_dir.clone(),
        lock_stale_secs: config.lock_stale_secs,
        journal: Journal::new(config.journal_path()),
    }
}

/// Long-running mode with in-process snapshot dispatch
pub async fn run_loop(config: Config) -> Result<()> {
    let engine = Arc::new(SnapshotEngine::from_config(&config));
    let (dispatcher, worker) = ChannelDispatcher::spawn(engine, snapshot_runner(&config));
    let tracker = build_tracker(&config, Arc::new(dispatcher))?;

    let period = Duration::from_secs(config.tick_interval_secs.max(1));
    let mut ticker = interval(period);
    // A tick that overruns the period does not cause a burst afterwards
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("[TRACKER] Running, tick every {}s", period.as_secs());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_tick(&config, &tracker).await {
                    error!("[TRACKER] Tick skipped: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[TRACKER] Shutting down");
                break;
            }
        }
    }

    // The tracker owns the last dispatcher handle; dropping it closes the channel
    drop(tracker);
    worker.await.context("snapshot worker")?;
    Ok(())
}
