//! Error types for sitewatch.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    /// DNS, connect, or timeout failure while probing a site. Counted as "down".
    #[error("Probe transport error for {site}: {reason}")]
    ProbeTransport { site: String, reason: String },

    /// A single malformed line in the site list.
    #[error("Site list line {line}: {reason}")]
    ConfigLine { line: usize, reason: String },

    /// The site list itself could not be read. Fatal for the current tick only.
    #[error("Cannot read site list {path}: {source}")]
    SiteListRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An expected log, config, or performance source is absent.
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// A file vanished between enumeration and copy.
    #[error("File vanished during collection: {0}")]
    FilesystemRace(PathBuf),

    /// The report could not be written. Fatal for that snapshot only.
    #[error("Report write failed for {path}: {reason}")]
    ReportWrite { path: PathBuf, reason: String },

    #[error("Invalid timestamp '{0}', expected YYYY-MM-DD HH:MM:SS")]
    Timestamp(String),

    #[error("Invalid interval: start {start} is not before end {end}")]
    Interval { start: String, end: String },

    #[error("Site {site} is locked by PID {pid}")]
    SiteLocked { site: String, pid: u32 },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;
