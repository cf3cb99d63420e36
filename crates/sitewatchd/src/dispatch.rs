//! Snapshot dispatch
//!
//! The tracker hands every resolved outage to a `SnapshotDispatch` and moves
//! on; it never waits for collection. Two implementations:
//! - `ChannelDispatcher`: long-running daemon, jobs go over an mpsc channel to
//!   a worker that runs each snapshot on the blocking pool
//! - `ProcessDispatcher`: one-shot ticks, each job becomes a detached
//!   `sitewatchd snapshot` child that outlives the tick

use anyhow::{Context, Result};
use sitewatch_common::journal::{Journal, JournalAction};
use sitewatch_common::site_lock::SiteLock;
use sitewatch_common::timefmt::format_timestamp;
use sitewatch_common::{OutageInterval, SnapshotEngine, SnapshotReport, SnapshotTarget, WatchError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Lock purpose for snapshot runs, distinct from the tick lock
pub const SNAPSHOT_LOCK: &str = "snapshot";

/// How long a snapshot waits for another run on the same site
const LOCK_RETRIES: u32 = 30;
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// One resolved outage waiting for collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotJob {
    pub target: SnapshotTarget,
    pub interval: OutageInterval,
}

/// Fire-and-forget hand-off of a snapshot job. Must not block on collection.
pub trait SnapshotDispatch: Send + Sync {
    fn dispatch(&self, job: SnapshotJob) -> Result<()>;
}

/// Where snapshot runs take their site locks and report their outcome
#[derive(Debug, Clone)]
pub struct SnapshotRunner {
    pub lock_dir: PathBuf,
    pub lock_stale_secs: u64,
    pub journal: Journal,
}

impl SnapshotRunner {
    /// Collect one snapshot, serialized per site across processes. Blocking.
    pub fn run(&self, engine: &SnapshotEngine, job: &SnapshotJob) -> Result<SnapshotReport> {
        let site = &job.target.site;
        let _lock = self.acquire_lock(site)?;

        match engine.collect(&job.target, &job.interval) {
            Ok(report) => {
                self.journal.log(
                    JournalAction::SnapshotWritten,
                    site,
                    format!(
                        "dir={} collected={} not_found={} failed={}",
                        report.report_dir.display(),
                        report.counts.collected,
                        report.counts.not_found,
                        report.counts.failed
                    ),
                );
                Ok(report)
            }
            Err(e) => {
                error!("[SNAPSHOT] {} failed: {}", site, e);
                self.journal.log(JournalAction::SnapshotFailed, site, e.to_string());
                Err(e.into())
            }
        }
    }

    fn acquire_lock(&self, site: &str) -> Result<SiteLock> {
        let mut attempt = 0;
        loop {
            match SiteLock::acquire(&self.lock_dir, site, SNAPSHOT_LOCK, self.lock_stale_secs) {
                Ok(lock) => return Ok(lock),
                Err(WatchError::SiteLocked { pid, .. }) if attempt < LOCK_RETRIES => {
                    attempt += 1;
                    debug!(
                        "[SNAPSHOT] {} busy (pid {}), retry {}/{}",
                        site, pid, attempt, LOCK_RETRIES
                    );
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    self.journal.log(JournalAction::SnapshotFailed, site, e.to_string());
                    return Err(e).context(format!("locking snapshot for {}", site));
                }
            }
        }
    }
}

/// In-process dispatcher for `sitewatchd run`
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<SnapshotJob>,
}

impl ChannelDispatcher {
    /// Start the worker. Drop every dispatcher clone, then await the handle to
    /// let in-flight snapshots finish.
    pub fn spawn(engine: Arc<SnapshotEngine>, runner: SnapshotRunner) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(rx, engine, Arc::new(runner)));
        (Self { tx }, handle)
    }
}

impl SnapshotDispatch for ChannelDispatcher {
    fn dispatch(&self, job: SnapshotJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|e| anyhow::anyhow!("snapshot worker is gone, dropped job for {}", e.0.target.site))
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<SnapshotJob>,
    engine: Arc<SnapshotEngine>,
    runner: Arc<SnapshotRunner>,
) {
    // One async mutex per site keeps same-site runs in order inside this process
    let mut site_gates: HashMap<String, Arc<Mutex<()>>> = HashMap::new();
    let mut running = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let gate = site_gates.entry(job.target.site.clone()).or_default().clone();
        let engine = engine.clone();
        let runner = runner.clone();

        running.spawn(async move {
            let _gate = gate.lock_owned().await;
            let site = job.target.site.clone();
            let outcome = tokio::task::spawn_blocking(move || runner.run(&engine, &job)).await;
            match outcome {
                Ok(Ok(report)) => info!("[SNAPSHOT] {} -> {}", site, report.report_dir.display()),
                Ok(Err(e)) => warn!("[SNAPSHOT] {} not written: {:#}", site, e),
                Err(e) => error!("[SNAPSHOT] {} worker panicked: {}", site, e),
            }
        });

        // Reap finished runs so the set does not grow for the daemon's lifetime
        while running.try_join_next().is_some() {}
    }

    debug!("[SNAPSHOT] Dispatch channel closed, waiting for {} run(s)", running.len());
    while running.join_next().await.is_some() {}
}

/// Detached child process dispatcher for `sitewatchd tick`
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessDispatcher {
    pub fn new(exe: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self { exe, config_path }
    }

    /// Dispatch to the currently running binary
    pub fn current_exe(config_path: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("locating sitewatchd binary")?;
        Ok(Self::new(exe, config_path))
    }

    pub fn command_args(&self, job: &SnapshotJob) -> Vec<String> {
        snapshot_args(self.config_path.as_deref(), job)
    }
}

/// Arguments of the `snapshot` subcommand for one job
pub fn snapshot_args(config_path: Option<&Path>, job: &SnapshotJob) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.extend([
        "snapshot".to_string(),
        "--site".to_string(),
        job.target.site.clone(),
        "--runtime".to_string(),
        job.target.runtime_version.clone(),
        "--root".to_string(),
        job.target.root_path.display().to_string(),
        "--start".to_string(),
        format_timestamp(&job.interval.started_at),
        "--end".to_string(),
        format_timestamp(&job.interval.ended_at),
    ]);
    args
}

impl SnapshotDispatch for ProcessDispatcher {
    fn dispatch(&self, job: SnapshotJob) -> Result<()> {
        let child = Command::new(&self.exe)
            .args(self.command_args(&job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning snapshot for {}", job.target.site))?;
        info!(
            "[SNAPSHOT] Spawned pid {} for {}",
            child.id(),
            job.target.site
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitewatch_common::timefmt::parse_timestamp;

    fn job() -> SnapshotJob {
        SnapshotJob {
            target: SnapshotTarget {
                site: "app1".to_string(),
                runtime_version: "8.1".to_string(),
                root_path: PathBuf::from("/home/runcloud/webapps/app1"),
            },
            interval: OutageInterval::new(
                "app1",
                parse_timestamp("2024-05-01 10:00:00").unwrap(),
                parse_timestamp("2024-05-01 10:10:00").unwrap(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_snapshot_args_with_config() {
        let dispatcher = ProcessDispatcher::new(
            PathBuf::from("/usr/local/bin/sitewatchd"),
            Some(PathBuf::from("/etc/sitewatch/alt.toml")),
        );
        let args = dispatcher.command_args(&job());
        assert_eq!(
            args,
            vec![
                "--config",
                "/etc/sitewatch/alt.toml",
                "snapshot",
                "--site",
                "app1",
                "--runtime",
                "8.1",
                "--root",
                "/home/runcloud/webapps/app1",
                "--start",
                "2024-05-01 10:00:00",
                "--end",
                "2024-05-01 10:10:00",
            ]
        );
    }

    #[test]
    fn test_snapshot_args_without_config() {
        let args = snapshot_args(None, &job());
        assert_eq!(args[0], "snapshot");
        assert_eq!(args.len(), 11);
    }

    #[test]
    fn test_missing_binary_is_dispatch_error() {
        let dispatcher =
            ProcessDispatcher::new(PathBuf::from("/nonexistent/sitewatchd-test"), None);
        assert!(dispatcher.dispatch(job()).is_err());
    }
}
