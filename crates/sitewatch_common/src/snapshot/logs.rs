//! Log slice collector
//!
//! Each log source is a table entry: candidate paths, a regex whose first
//! group captures the timestamp, and a chrono format for that text. The
//! scanner is the same for every source. Lines without a parseable timestamp
//! are skipped; they never end the scan.

use super::{ArtifactStatus, LOGS_DIR};
use crate::config::LogSourceDef;
use crate::error::{Result, WatchError};
use crate::outage::OutageInterval;
use crate::resolver::{resolve_first, PathContext};
use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A log source with its regex compiled
#[derive(Debug, Clone)]
pub struct LogSource {
    pub def: LogSourceDef,
    regex: Regex,
    has_offset: bool,
}

impl LogSource {
    pub fn compile(def: &LogSourceDef) -> Result<Self> {
        let regex = Regex::new(&def.regex)
            .map_err(|e| WatchError::Config(format!("log source {}: {}", def.name, e)))?;
        Ok(Self {
            def: def.clone(),
            regex,
            has_offset: def.format.contains("%z") || def.format.contains("%:z"),
        })
    }

    /// Local wall-clock timestamp of a line, if it has one
    pub fn line_timestamp(&self, line: &str) -> Option<NaiveDateTime> {
        let raw = self.regex.captures(line)?.get(1)?.as_str();
        if self.has_offset {
            DateTime::parse_from_str(raw, &self.def.format)
                .ok()
                .map(|dt| dt.with_timezone(&Local).naive_local())
        } else {
            NaiveDateTime::parse_from_str(raw, &self.def.format).ok()
        }
    }
}

/// Copy lines inside the interval from `reader` to `out`. Returns the number kept.
pub fn extract_window<R: BufRead, W: Write>(
    mut reader: R,
    source: &LogSource,
    interval: &OutageInterval,
    out: &mut W,
) -> std::io::Result<usize> {
    let mut kept = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let Some(ts) = source.line_timestamp(&line) else {
            continue;
        };
        if interval.contains(&ts) {
            out.write_all(&buf)?;
            if !buf.ends_with(b"\n") {
                out.write_all(b"\n")?;
            }
            kept += 1;
        }
    }
    Ok(kept)
}

/// Collect one slice per configured log source into `{report}/logs/`.
pub fn collect_logs(
    sources: &[LogSourceDef],
    ctx: &PathContext,
    interval: &OutageInterval,
    report_dir: &Path,
) -> BTreeMap<String, ArtifactStatus> {
    let mut results = BTreeMap::new();
    for def in sources {
        let status = collect_one(def, ctx, interval, report_dir);
        match &status {
            ArtifactStatus::Collected { lines, source, .. } => info!(
                "[SNAPSHOT] Log {}: {} line(s) from {}",
                def.name,
                lines.unwrap_or(0),
                source.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            ArtifactStatus::NotFound { reason, .. } => {
                warn!("[SNAPSHOT] Log {} not found: {}", def.name, reason)
            }
            ArtifactStatus::Failed { error } => {
                warn!("[SNAPSHOT] Log {} failed: {}", def.name, error)
            }
        }
        results.insert(def.name.clone(), status);
    }
    results
}

fn collect_one(
    def: &LogSourceDef,
    ctx: &PathContext,
    interval: &OutageInterval,
    report_dir: &Path,
) -> ArtifactStatus {
    let source = match LogSource::compile(def) {
        Ok(s) => s,
        Err(e) => return ArtifactStatus::failed(e),
    };

    let resolution = resolve_first(ctx, &def.candidates);
    let Some(log_path) = resolution.found else {
        return ArtifactStatus::NotFound {
            reason: "no candidate log file exists".to_string(),
            tried: resolution.tried,
        };
    };

    let relative = PathBuf::from(LOGS_DIR).join(format!("{}.slice.log", def.name));
    let dest = report_dir.join(&relative);

    match write_slice(&log_path, &source, interval, &dest) {
        Ok(0) => {
            let _ = fs::remove_file(&dest);
            ArtifactStatus::NotFound {
                reason: "no entries in window".to_string(),
                tried: vec![log_path],
            }
        }
        Ok(kept) => {
            let bytes = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
            ArtifactStatus::Collected {
                location: relative,
                source: Some(log_path),
                bytes,
                lines: Some(kept),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArtifactStatus::NotFound {
            reason: format!("log file disappeared: {}", e),
            tried: vec![log_path],
        },
        Err(e) => {
            let _ = fs::remove_file(&dest);
            ArtifactStatus::failed(format!("reading {}: {}", log_path.display(), e))
        }
    }
}

fn write_slice(
    log_path: &Path,
    source: &LogSource,
    interval: &OutageInterval,
    dest: &Path,
) -> std::io::Result<usize> {
    let reader = BufReader::new(File::open(log_path)?);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(dest)?);
    let kept = extract_window(reader, source, interval, &mut out)?;
    out.flush()?;
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::timefmt::parse_timestamp;
    use std::io::Cursor;

    fn default_source(name: &str) -> LogSource {
        let def = Config::default()
            .log_sources
            .into_iter()
            .find(|s| s.name == name)
            .unwrap();
        LogSource::compile(&def).unwrap()
    }

    fn window() -> OutageInterval {
        OutageInterval::new(
            "app1",
            parse_timestamp("2024-05-01 10:00:00").unwrap(),
            parse_timestamp("2024-05-01 10:10:00").unwrap(),
        )
        .unwrap()
    }

    fn run(source: &LogSource, input: &str) -> (usize, String) {
        let mut out = Vec::new();
        let kept = extract_window(Cursor::new(input.as_bytes()), source, &window(), &mut out).unwrap();
        (kept, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_nginx_error_window_is_inclusive() {
        let source = default_source("nginx_error");
        let input = "2024/05/01 09:59:59 [error] before\n\
                     2024/05/01 10:00:00 [error] first\n\
                     garbage without timestamp\n\
                     2024/05/01 10:05:00 [crit] middle\n\
                     2024/05/01 10:10:00 [error] last\n\
                     2024/05/01 10:10:01 [error] after\n";
        let (kept, out) = run(&source, input);
        assert_eq!(kept, 3);
        assert_eq!(
            out,
            "2024/05/01 10:00:00 [error] first\n\
             2024/05/01 10:05:00 [crit] middle\n\
             2024/05/01 10:10:00 [error] last\n"
        );
    }

    #[test]
    fn test_php_slow_log_format() {
        let source = default_source("php_fpm_slow");
        let input = "[01-May-2024 10:03:12]  [pool app1] pid 4242\n\
                     script_filename = /srv/app1/index.php\n\
                     [01-May-2024 11:03:12]  [pool app1] pid 4243\n";
        let (kept, out) = run(&source, input);
        assert_eq!(kept, 1);
        assert!(out.starts_with("[01-May-2024 10:03:12]"));
    }

    #[test]
    fn test_access_log_offset_converted_to_local() {
        let source = default_source("nginx_access");
        let inside = parse_timestamp("2024-05-01 10:04:00").unwrap();
        let local = inside.and_local_timezone(Local).single().unwrap();
        let stamp = local.format("%d/%b/%Y:%H:%M:%S %z").to_string();
        let input = format!(
            "1.2.3.4 - - [{}] \"GET / HTTP/1.1\" 502 157\n\
             1.2.3.4 - - [01/May/2023:10:04:00 +0000] \"GET / HTTP/1.1\" 200 10\n",
            stamp
        );
        let (kept, out) = run(&source, &input);
        assert_eq!(kept, 1);
        assert!(out.contains(" 502 "));
    }

    #[test]
    fn test_invalid_utf8_and_bad_dates_skipped() {
        let source = default_source("nginx_error");
        let mut input = b"2024/13/45 10:00:00 bad date\n".to_vec();
        input.extend_from_slice(b"2024/05/01 10:01:00 \xff\xfe binary\n");
        input.extend_from_slice(b"2024/05/01 10:02:00 no newline");
        let mut out = Vec::new();
        let kept = extract_window(Cursor::new(input), &source, &window(), &mut out).unwrap();
        assert_eq!(kept, 2);
        assert!(out.ends_with(b"no newline\n"));
    }
}
