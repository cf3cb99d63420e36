//! Transition journal
//!
//! Append-only record of every outage transition and snapshot outcome.
//! Lives at {state_dir}/transitions.log
//!
//! Format: local timestamp + action + site + detail
//! Example: 2024-05-01 10:10:00 resolved app1 started=2024-05-01 10:00:00

use crate::timefmt::{format_timestamp, now_local, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalAction {
    Opened,
    Resolved,
    SnapshotDispatched,
    SnapshotWritten,
    SnapshotFailed,
}

impl JournalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalAction::Opened => "opened",
            JournalAction::Resolved => "resolved",
            JournalAction::SnapshotDispatched => "dispatched",
            JournalAction::SnapshotWritten => "snapshot",
            JournalAction::SnapshotFailed => "snapshot_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opened" => Some(JournalAction::Opened),
            "resolved" => Some(JournalAction::Resolved),
            "dispatched" => Some(JournalAction::SnapshotDispatched),
            "snapshot" => Some(JournalAction::SnapshotWritten),
            "snapshot_failed" => Some(JournalAction::SnapshotFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub timestamp: NaiveDateTime,
    pub action: JournalAction,
    pub site: String,
    pub detail: String,
}

impl JournalEntry {
    pub fn new(action: JournalAction, site: &str, detail: impl Into<String>) -> Self {
        Self {
            timestamp: now_local(),
            action,
            site: site.to_string(),
            detail: detail.into(),
        }
    }

    pub fn to_log_line(&self) -> String {
        format!(
            "{} {} {} {}",
            format_timestamp(&self.timestamp),
            self.action.as_str(),
            self.site,
            self.detail.replace('\n', " ")
        )
    }

    pub fn from_log_line(line: &str) -> Option<Self> {
        // The timestamp itself holds one space
        let parts: Vec<&str> = line.splitn(5, ' ').collect();
        if parts.len() < 4 {
            return None;
        }
        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{} {}", parts[0], parts[1]), TIMESTAMP_FORMAT)
                .ok()?;
        Some(Self {
            timestamp,
            action: JournalAction::parse(parts[2])?,
            site: parts[3].to_string(),
            detail: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
        })
    }
}

/// Journal file handle
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &JournalEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_log_line())?;
        Ok(())
    }

    pub fn log(&self, action: JournalAction, site: &str, detail: impl Into<String>) {
        if let Err(e) = self.record(&JournalEntry::new(action, site, detail)) {
            tracing::warn!("[JOURNAL] Failed to append to {}: {}", self.path.display(), e);
        }
    }

    pub fn read_all(&self) -> Vec<JournalEntry> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| JournalEntry::from_log_line(&line))
            .collect()
    }

    /// Last `count` entries, oldest first
    pub fn read_recent(&self, count: usize) -> Vec<JournalEntry> {
        let all = self.read_all();
        let skip = all.len().saturating_sub(count);
        all.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_line_format() {
        let entry = JournalEntry {
            timestamp: crate::timefmt::parse_timestamp("2024-05-01 10:10:00").unwrap(),
            action: JournalAction::Resolved,
            site: "app1".to_string(),
            detail: "started=2024-05-01 10:00:00".to_string(),
        };
        let line = entry.to_log_line();
        assert_eq!(line, "2024-05-01 10:10:00 resolved app1 started=2024-05-01 10:00:00");
        assert_eq!(JournalEntry::from_log_line(&line), Some(entry));
    }

    #[test]
    fn test_append_and_read_recent() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(dir.path().join("state/transitions.log"));
        journal.log(JournalAction::Opened, "app1", "HTTP 503");
        journal.log(JournalAction::Resolved, "app1", "started=x");
        journal.log(JournalAction::SnapshotDispatched, "app1", "");

        assert_eq!(journal.read_all().len(), 3);
        let recent = journal.read_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, JournalAction::Resolved);
        assert_eq!(recent[1].action, JournalAction::SnapshotDispatched);
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transitions.log");
        fs::write(&path, "garbage\n2024-05-01 10:00:00 exploded app1 x\n").unwrap();
        assert!(Journal::new(path).read_all().is_empty());
    }
}
