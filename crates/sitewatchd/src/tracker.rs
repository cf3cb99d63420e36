//! Outage tracker
//!
//! One tick probes every site once and applies the outcome to that site's
//! durable outage state. Each site is handled under its own lock file so
//! overlapping ticks (two cron runs) never interleave on one site. A site
//! whose lock is held elsewhere is skipped until the next tick.
//!
//! Errors stay with their site: a failed probe is an outcome, and a state or
//! lock error is logged and reported without touching the other sites.

use crate::dispatch::{SnapshotDispatch, SnapshotJob};
use crate::probe::Prober;
use chrono::NaiveDateTime;
use sitewatch_common::journal::{Journal, JournalAction};
use sitewatch_common::site_lock::SiteLock;
use sitewatch_common::timefmt::{format_timestamp, now_local};
use sitewatch_common::{
    transition, Config, OutageInterval, SiteDescriptor, SnapshotTarget, StateStore, StatusOutcome,
    Transition, WatchError,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lock purpose for probe-and-update
pub const TICK_LOCK: &str = "tick";

/// Source of "now" for transitions
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock, truncated to seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        now_local()
    }
}

/// What happened to one site during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteOutcome {
    Healthy,
    StillDown,
    Opened,
    Resolved(OutageInterval),
    /// Another process holds the site's tick lock
    Locked,
}

/// Per-tick summary
#[derive(Debug, Default)]
pub struct TickReport {
    pub checked: usize,
    pub opened: Vec<String>,
    pub resolved: Vec<OutageInterval>,
    pub still_down: Vec<String>,
    pub locked: Vec<String>,
    /// Sites whose state could not be read or written
    pub errors: Vec<(String, String)>,
}

impl TickReport {
    fn record(&mut self, site: &str, outcome: SiteOutcome) {
        self.checked += 1;
        match outcome {
            SiteOutcome::Healthy => {}
            SiteOutcome::StillDown => self.still_down.push(site.to_string()),
            SiteOutcome::Opened => self.opened.push(site.to_string()),
            SiteOutcome::Resolved(interval) => self.resolved.push(interval),
            SiteOutcome::Locked => self.locked.push(site.to_string()),
        }
    }
}

/// The outage tracker
pub struct Tracker {
    ledger: Ledger,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    lock_dir: PathBuf,
    lock_stale_secs: u64,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn StateStore>,
        prober: Arc<dyn Prober>,
        dispatcher: Arc<dyn SnapshotDispatch>,
        journal: Journal,
        lock_dir: PathBuf,
        lock_stale_secs: u64,
    ) -> Self {
        Self {
            ledger: Ledger {
                store,
                dispatcher,
                journal,
            },
            prober,
            clock: Arc::new(SystemClock),
            lock_dir,
            lock_stale_secs,
        }
    }

    /// Tracker over the file store, journal, and lock directory named by `config`
    pub fn from_config(
        config: &Config,
        store: Arc<dyn StateStore>,
        prober: Arc<dyn Prober>,
        dispatcher: Arc<dyn SnapshotDispatch>,
    ) -> Self {
        Self::new(
            store,
            prober,
            dispatcher,
            Journal::new(config.journal_path()),
            config.state_dir.clone(),
            config.lock_stale_secs,
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Probe every site once, sequentially, and apply the transitions
    pub async fn evaluate_tick(&self, sites: &[SiteDescriptor]) -> TickReport {
        let mut report = TickReport::default();
        for site in sites {
            match self.evaluate_site(site).await {
                Ok(outcome) => report.record(&site.name, outcome),
                Err(e) => {
                    error!("[TRACKER] {}: {}", site.name, e);
                    report.checked += 1;
                    report.errors.push((site.name.clone(), e.to_string()));
                }
            }
        }

        info!(
            "[TRACKER] Tick done: {} checked, {} opened, {} resolved, {} down, {} locked, {} error(s)",
            report.checked,
            report.opened.len(),
            report.resolved.len(),
            report.still_down.len(),
            report.locked.len(),
            report.errors.len()
        );
        report
    }

    /// Probe one site and persist its transition
    ///
    /// Lock files, state records, and the journal are touched on the blocking
    /// pool; only the probe itself runs on the async workers.
    pub async fn evaluate_site(&self, site: &SiteDescriptor) -> Result<SiteOutcome, WatchError> {
        let (dir, name, stale_secs) = (
            self.lock_dir.clone(),
            site.name.clone(),
            self.lock_stale_secs,
        );
        let lock = match blocking(move || SiteLock::acquire(&dir, &name, TICK_LOCK, stale_secs)).await {
            Ok(lock) => lock,
            Err(WatchError::SiteLocked { pid, .. }) => {
                info!("[TRACKER] {} is locked by pid {}, skipping this tick", site.name, pid);
                return Ok(SiteOutcome::Locked);
            }
            Err(e) => return Err(e),
        };

        let outcome = self.prober.probe(site).await;
        let now = self.clock.now();

        let ledger = self.ledger.clone();
        let site = site.clone();
        blocking(move || {
            // Released once the transition is recorded
            let _lock = lock;
            ledger.apply(&site, &outcome, now)
        })
        .await
    }
}

/// Run filesystem work on tokio's blocking pool
async fn blocking<T, F>(f: F) -> Result<T, WatchError>
where
    F: FnOnce() -> Result<T, WatchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WatchError::Io(io::Error::other(e.to_string())))?
}

/// Durable side of the tracker: state records, journal, and snapshot hand-off
#[derive(Clone)]
struct Ledger {
    store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn SnapshotDispatch>,
    journal: Journal,
}

impl Ledger {
    fn apply(
        &self,
        site: &SiteDescriptor,
        outcome: &StatusOutcome,
        now: NaiveDateTime,
    ) -> Result<SiteOutcome, WatchError> {
        let current = self.store.load(&site.name)?;

        match transition(&site.name, current.as_ref(), outcome, now) {
            Transition::Unchanged => {
                if current.is_some() {
                    debug!("[TRACKER] {} still down ({})", site.name, outcome.describe());
                    Ok(SiteOutcome::StillDown)
                } else {
                    debug!("[TRACKER] {} up ({})", site.name, outcome.describe());
                    Ok(SiteOutcome::Healthy)
                }
            }
            Transition::Opened(state) => {
                self.store.save(&state)?;
                warn!(
                    "[TRACKER] {} DOWN at {} ({})",
                    site.name,
                    format_timestamp(&state.started_at),
                    outcome.describe()
                );
                self.journal.log(
                    JournalAction::Opened,
                    &site.name,
                    format!(
                        "started={} reason={}",
                        format_timestamp(&state.started_at),
                        outcome.describe()
                    ),
                );
                Ok(SiteOutcome::Opened)
            }
            Transition::Resolved(interval) => {
                // Record removal first: a crash after this loses the snapshot
                // instead of resolving the same outage twice.
                self.store.remove(&site.name)?;
                info!(
                    "[TRACKER] {} UP, outage {} .. {} ({}s)",
                    site.name,
                    format_timestamp(&interval.started_at),
                    format_timestamp(&interval.ended_at),
                    interval.duration().num_seconds()
                );
                self.journal.log(
                    JournalAction::Resolved,
                    &site.name,
                    format!(
                        "started={} ended={} duration={}s",
                        format_timestamp(&interval.started_at),
                        format_timestamp(&interval.ended_at),
                        interval.duration().num_seconds()
                    ),
                );
                self.dispatch_snapshot(site, &interval);
                Ok(SiteOutcome::Resolved(interval))
            }
        }
    }

    fn dispatch_snapshot(&self, site: &SiteDescriptor, interval: &OutageInterval) {
        let job = SnapshotJob {
            target: SnapshotTarget::from(site),
            interval: interval.clone(),
        };
        match self.dispatcher.dispatch(job) {
            Ok(()) => self.journal.log(
                JournalAction::SnapshotDispatched,
                &site.name,
                format!("started={}", format_timestamp(&interval.started_at)),
            ),
            Err(e) => {
                error!("[TRACKER] Snapshot dispatch for {} failed: {:#}", site.name, e);
                self.journal
                    .log(JournalAction::SnapshotFailed, &site.name, format!("dispatch: {:#}", e));
            }
        }
    }
}
