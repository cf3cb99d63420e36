//! Performance counter collector
//!
//! Historical CPU, memory, and load figures come from sysstat's `sar`.
//! Missing data (sysstat not installed, no daily file for that day) is an
//! expected absence and is recorded as not found.

use super::{ArtifactStatus, PERF_DIR};
use crate::config::PerfMetricDef;
use crate::outage::OutageInterval;
use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Answer from a counter history query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterQuery {
    Data(String),
    NoData(String),
    Failed(String),
}

/// Source of historical performance counters
pub trait CounterSource: Send + Sync {
    fn query(&self, metric: &PerfMetricDef, interval: &OutageInterval) -> CounterQuery;
}

/// `sar` backed counter source
#[derive(Debug, Clone)]
pub struct SarSource {
    pub binary: String,
    pub sa_dir: PathBuf,
}

impl SarSource {
    pub fn new(binary: impl Into<String>, sa_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            sa_dir: sa_dir.into(),
        }
    }
}

/// Arguments for one sar query.
///
/// sar's `-s/-e` only take a time of day, so the window is bounded to the day
/// the outage started. Past days read their `saDD` file explicitly.
pub fn sar_args(
    metric: &PerfMetricDef,
    interval: &OutageInterval,
    today: NaiveDate,
    sa_dir: &Path,
) -> Vec<String> {
    let start_day = interval.started_at.date();
    let end_time = if interval.ended_at.date() == start_day {
        interval.ended_at.time()
    } else {
        start_day
            .and_hms_opt(23, 59, 59)
            .map(|t| t.time())
            .unwrap_or_else(|| interval.started_at.time())
    };

    let mut args = vec![metric.flag.clone()];
    if start_day != today {
        args.push("-f".to_string());
        args.push(
            sa_dir
                .join(format!("sa{}", start_day.format("%d")))
                .to_string_lossy()
                .to_string(),
        );
    }
    args.push("-s".to_string());
    args.push(interval.started_at.time().format("%H:%M:%S").to_string());
    args.push("-e".to_string());
    args.push(end_time.format("%H:%M:%S").to_string());
    args
}

impl CounterSource for SarSource {
    fn query(&self, metric: &PerfMetricDef, interval: &OutageInterval) -> CounterQuery {
        let today = Local::now().date_naive();
        let args = sar_args(metric, interval, today, &self.sa_dir);

        let output = match Command::new(&self.binary).args(&args).output() {
            Ok(o) => o,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return CounterQuery::NoData(format!("{} not installed", self.binary))
            }
            Err(e) => return CounterQuery::Failed(format!("running {}: {}", self.binary, e)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() || stderr.contains("Cannot open") {
            return CounterQuery::NoData(if stderr.is_empty() {
                format!("{} exited with {}", self.binary, output.status)
            } else {
                stderr
            });
        }
        CounterQuery::Data(stdout)
    }
}

/// Query every metric and write `{report}/perf/sar_{metric}.txt`.
pub fn collect_performance(
    counters: &dyn CounterSource,
    metrics: &[PerfMetricDef],
    interval: &OutageInterval,
    report_dir: &Path,
) -> BTreeMap<String, ArtifactStatus> {
    let mut results = BTreeMap::new();
    for metric in metrics {
        let status = match counters.query(metric, interval) {
            CounterQuery::Data(text) => write_metric(&metric.name, &text, report_dir),
            CounterQuery::NoData(reason) => ArtifactStatus::NotFound {
                reason,
                tried: Vec::new(),
            },
            CounterQuery::Failed(error) => ArtifactStatus::Failed { error },
        };
        match &status {
            ArtifactStatus::Collected { .. } => info!("[SNAPSHOT] Saved {} data", metric.name),
            ArtifactStatus::NotFound { reason, .. } => {
                warn!("[SNAPSHOT] No {} data: {}", metric.name, reason)
            }
            ArtifactStatus::Failed { error } => {
                warn!("[SNAPSHOT] Could not collect {}: {}", metric.name, error)
            }
        }
        results.insert(metric.name.clone(), status);
    }
    results
}

fn write_metric(name: &str, text: &str, report_dir: &Path) -> ArtifactStatus {
    let relative = PathBuf::from(PERF_DIR).join(format!("sar_{}.txt", name));
    let dest = report_dir.join(&relative);
    match fs::create_dir_all(report_dir.join(PERF_DIR)).and_then(|_| fs::write(&dest, text)) {
        Ok(()) => ArtifactStatus::Collected {
            location: relative,
            source: None,
            bytes: text.len() as u64,
            lines: Some(text.lines().count()),
        },
        Err(e) => ArtifactStatus::failed(format!("writing {}: {}", dest.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::parse_timestamp;
    use tempfile::TempDir;

    fn metric(name: &str, flag: &str) -> PerfMetricDef {
        PerfMetricDef {
            name: name.to_string(),
            flag: flag.to_string(),
        }
    }

    fn interval(start: &str, end: &str) -> OutageInterval {
        OutageInterval::new(
            "app1",
            parse_timestamp(start).unwrap(),
            parse_timestamp(end).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_sar_args_same_day() {
        let i = interval("2024-05-01 10:00:00", "2024-05-01 10:10:00");
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let args = sar_args(&metric("cpu_usage", "-u"), &i, today, Path::new("/var/log/sa"));
        assert_eq!(args, vec!["-u", "-s", "10:00:00", "-e", "10:10:00"]);
    }

    #[test]
    fn test_sar_args_previous_day_and_midnight() {
        let i = interval("2024-04-28 23:50:00", "2024-04-29 00:20:00");
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let args = sar_args(&metric("load_average", "-q"), &i, today, Path::new("/var/log/sa"));
        assert_eq!(
            args,
            vec!["-q", "-f", "/var/log/sa/sa28", "-s", "23:50:00", "-e", "23:59:59"]
        );
    }

    struct Scripted;

    impl CounterSource for Scripted {
        fn query(&self, metric: &PerfMetricDef, _interval: &OutageInterval) -> CounterQuery {
            match metric.name.as_str() {
                "cpu_usage" => CounterQuery::Data("10:00:01 all 97.0\n10:05:01 all 99.0\n".into()),
                "memory_usage" => CounterQuery::NoData("Cannot open /var/log/sa/sa01".into()),
                _ => CounterQuery::Failed("permission denied".into()),
            }
        }
    }

    #[test]
    fn test_each_metric_recorded_independently() {
        let dir = TempDir::new().unwrap();
        let metrics = vec![
            metric("cpu_usage", "-u"),
            metric("memory_usage", "-r"),
            metric("load_average", "-q"),
        ];
        let i = interval("2024-05-01 10:00:00", "2024-05-01 10:10:00");
        let results = collect_performance(&Scripted, &metrics, &i, dir.path());

        match &results["cpu_usage"] {
            ArtifactStatus::Collected { location, lines, .. } => {
                assert_eq!(location, &PathBuf::from("perf/sar_cpu_usage.txt"));
                assert_eq!(*lines, Some(2));
                assert!(dir.path().join(location).is_file());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(results["memory_usage"], ArtifactStatus::NotFound { .. }));
        assert!(matches!(results["load_average"], ArtifactStatus::Failed { .. }));
    }

    #[test]
    fn test_missing_binary_is_not_found() {
        let source = SarSource::new("/nonexistent/bin/sar", "/var/log/sa");
        let i = interval("2024-05-01 10:00:00", "2024-05-01 10:10:00");
        assert!(matches!(
            source.query(&metric("cpu_usage", "-u"), &i),
            CounterQuery::NoData(_)
        ));
    }
}
