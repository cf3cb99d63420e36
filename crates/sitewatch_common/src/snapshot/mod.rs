//! Snapshot engine
//!
//! Given a resolved outage, collects log slices, performance counters,
//! configuration files, and changed application files into one report
//! directory named `{site}_{YYYYmmdd_HHMMSS}` after the outage start.
//!
//! Every collector is best-effort: a missing source becomes a `not_found`
//! entry and an unexpected error a `failed` entry. Only failing to write the
//! report itself fails the snapshot.
//!
//! The report is built in `{name}.partial` and `summary.json` is written last,
//! then the directory is renamed into place. A directory without the
//! `.partial` suffix is always complete.

pub mod configs;
pub mod fs_changes;
pub mod logs;
pub mod perf;

use crate::config::{Config, ConfigSourceDef, LogSourceDef, PerfMetricDef};
use crate::error::{Result, WatchError};
use crate::outage::OutageInterval;
use crate::resolver::PathContext;
use crate::sites::SiteDescriptor;
use crate::state_store::atomic_write;
use crate::timefmt::{now_local, serde_ts, DIR_STAMP_FORMAT};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use perf::{CounterQuery, CounterSource, SarSource};

pub const SUMMARY_FILE: &str = "summary.json";
pub const LOGS_DIR: &str = "logs";
pub const PERF_DIR: &str = "perf";
pub const CONFIGS_DIR: &str = "configs";
pub const MODIFIED_DIR: &str = "modified_files";
pub const MANIFEST_FILE: &str = "modified_files_manifest.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Result of collecting one artifact. Locations are relative to the report directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Collected {
        location: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
        bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
    NotFound {
        reason: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tried: Vec<PathBuf>,
    },
    Failed {
        error: String,
    },
}

impl ArtifactStatus {
    pub fn failed(error: impl Display) -> Self {
        ArtifactStatus::Failed {
            error: error.to_string(),
        }
    }

    pub fn is_collected(&self) -> bool {
        matches!(self, ArtifactStatus::Collected { .. })
    }
}

/// Who the snapshot is for. A site descriptor without its probe URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTarget {
    pub site: String,
    pub runtime_version: String,
    pub root_path: PathBuf,
}

impl From<&SiteDescriptor> for SnapshotTarget {
    fn from(site: &SiteDescriptor) -> Self {
        Self {
            site: site.name.clone(),
            runtime_version: site.runtime_version.clone(),
            root_path: site.root_path.clone(),
        }
    }
}

/// Filesystem change section of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedFilesSummary {
    #[serde(flatten)]
    pub status: ArtifactStatus,
    pub copied: usize,
    pub vanished: usize,
    pub failed: usize,
}

/// Counts across all artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub collected: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl ReportCounts {
    fn add(&mut self, status: &ArtifactStatus) {
        match status {
            ArtifactStatus::Collected { .. } => self.collected += 1,
            ArtifactStatus::NotFound { .. } => self.not_found += 1,
            ArtifactStatus::Failed { .. } => self.failed += 1,
        }
    }
}

/// Contents of `summary.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub site: String,
    pub runtime_version: String,
    pub root_path: PathBuf,
    pub interval: OutageInterval,
    pub duration_secs: i64,
    #[serde(with = "serde_ts")]
    pub generated_at: NaiveDateTime,
    pub report_dir: PathBuf,
    pub logs: BTreeMap<String, ArtifactStatus>,
    pub performance: BTreeMap<String, ArtifactStatus>,
    pub configs: BTreeMap<String, ArtifactStatus>,
    pub modified_files: ModifiedFilesSummary,
    pub counts: ReportCounts,
}

impl SnapshotReport {
    pub fn load(report_dir: &Path) -> Result<Self> {
        let content = fs::read_to_string(report_dir.join(SUMMARY_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Deterministic report directory for an outage
pub fn report_dir_name(site: &str, started_at: &NaiveDateTime) -> String {
    format!("{}_{}", site, started_at.format(DIR_STAMP_FORMAT))
}

/// The snapshot engine
pub struct SnapshotEngine {
    output_dir: PathBuf,
    log_dir: PathBuf,
    log_sources: Vec<LogSourceDef>,
    config_sources: Vec<ConfigSourceDef>,
    perf_metrics: Vec<PerfMetricDef>,
    counters: Box<dyn CounterSource>,
}

impl SnapshotEngine {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            log_dir: config.log_dir.clone(),
            log_sources: config.log_sources.clone(),
            config_sources: config.config_sources.clone(),
            perf_metrics: config.perf_metrics.clone(),
            counters: Box::new(SarSource::new(config.sar_binary.clone(), config.sa_dir.clone())),
        }
    }

    /// Replace the performance counter backend
    pub fn with_counter_source(mut self, counters: Box<dyn CounterSource>) -> Self {
        self.counters = counters;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Build the report for one outage and return it. Returns the existing
    /// report untouched if this outage was already collected.
    pub fn collect(&self, target: &SnapshotTarget, interval: &OutageInterval) -> Result<SnapshotReport> {
        let name = report_dir_name(&target.site, &interval.started_at);
        let final_dir = self.output_dir.join(&name);
        let staging = self.output_dir.join(format!("{}{}", name, PARTIAL_SUFFIX));

        if final_dir.exists() {
            info!("[SNAPSHOT] Report already exists: {}", final_dir.display());
            return SnapshotReport::load(&final_dir).map_err(|e| report_error(&final_dir, e));
        }

        prepare_staging(&staging).map_err(|e| report_error(&staging, e))?;
        info!(
            "[SNAPSHOT] Collecting {} for {} .. {}",
            target.site,
            crate::timefmt::format_timestamp(&interval.started_at),
            crate::timefmt::format_timestamp(&interval.ended_at)
        );

        let ctx = PathContext {
            site: target.site.clone(),
            runtime: target.runtime_version.clone(),
            root: target.root_path.clone(),
            log_dir: self.log_dir.clone(),
        };

        let logs = logs::collect_logs(&self.log_sources, &ctx, interval, &staging);
        let performance =
            perf::collect_performance(self.counters.as_ref(), &self.perf_metrics, interval, &staging);
        let configs = configs::collect_configs(&self.config_sources, &ctx, &staging);

        let exclude: Vec<PathBuf> = fs::canonicalize(&self.output_dir).into_iter().collect();
        let (fs_status, manifest) =
            fs_changes::collect_modified_files(&target.root_path, interval, &staging, &exclude);
        let modified_files = ModifiedFilesSummary {
            status: fs_status,
            copied: manifest.as_ref().map(|m| m.entries.len()).unwrap_or(0),
            vanished: manifest.as_ref().map(|m| m.vanished.len()).unwrap_or(0),
            failed: manifest.as_ref().map(|m| m.failed.len()).unwrap_or(0),
        };

        let mut counts = ReportCounts::default();
        for status in logs.values().chain(performance.values()).chain(configs.values()) {
            counts.add(status);
        }
        counts.add(&modified_files.status);

        let report = SnapshotReport {
            site: target.site.clone(),
            runtime_version: target.runtime_version.clone(),
            root_path: target.root_path.clone(),
            interval: interval.clone(),
            duration_secs: interval.duration().num_seconds(),
            generated_at: now_local(),
            report_dir: final_dir.clone(),
            logs,
            performance,
            configs,
            modified_files,
            counts,
        };

        finalize(&report, &staging, &final_dir).map_err(|e| report_error(&final_dir, e))?;
        info!(
            "[SNAPSHOT] Report complete: {} ({} collected, {} not found, {} failed)",
            final_dir.display(),
            report.counts.collected,
            report.counts.not_found,
            report.counts.failed
        );
        Ok(report)
    }
}

fn report_error(path: &Path, e: impl Display) -> WatchError {
    WatchError::ReportWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn prepare_staging(staging: &Path) -> io::Result<()> {
    if staging.exists() {
        warn!("[SNAPSHOT] Removing interrupted report {}", staging.display());
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)
}

/// Summary last, then rename into place
fn finalize(report: &SnapshotReport, staging: &Path, final_dir: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    atomic_write(&staging.join(SUMMARY_FILE), json.as_bytes())?;
    fs::rename(staging, final_dir)?;
    Ok(())
}
