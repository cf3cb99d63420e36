//! Configuration management for sitewatch.
//!
//! Loads settings from /etc/sitewatch/config.toml or uses defaults.
//! Log sources and config candidates are data, so new hosting layouts are
//! added here rather than in the collectors.

use crate::error::{Result, WatchError};
use crate::sites::is_valid_site_name;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sitewatch/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/sitewatch/config.toml";

/// How to find and time-filter one log source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSourceDef {
    /// Artifact name, also used for the extract file name
    pub name: String,
    /// Candidate paths in priority order, with placeholders
    pub candidates: Vec<String>,
    /// Regex whose first capture group is the timestamp text
    pub regex: String,
    /// chrono format for the captured text. `%z` formats are converted to local time.
    pub format: String,
}

/// How to find one kind of configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSourceDef {
    pub kind: String,
    pub candidates: Vec<String>,
}

/// Performance metric queried from the counter history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfMetricDef {
    pub name: String,
    /// Report flag passed to sar (e.g. `-u`)
    pub flag: String,
}

/// Where the active configuration was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    /// No file could be loaded; holds the last error
    Defaults(String),
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Line-oriented site list
    #[serde(default = "default_sites_file")]
    pub sites_file: PathBuf,

    /// Per-site outage state, locks, and the transition journal
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Where snapshot reports are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Application log directory, available to candidates as `{log_dir}`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Where sitewatch writes its own log file
    #[serde(default = "default_self_log_dir")]
    pub self_log_dir: PathBuf,

    /// Probe connect + response timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Tick period for `sitewatchd run`
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Age after which a site lock is reclaimed even if its owner looks alive
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,

    #[serde(default = "default_sar_binary")]
    pub sar_binary: String,

    /// Directory holding daily `saDD` files
    #[serde(default = "default_sa_dir")]
    pub sa_dir: PathBuf,

    #[serde(default = "default_perf_metrics")]
    pub perf_metrics: Vec<PerfMetricDef>,

    #[serde(default = "default_log_sources")]
    pub log_sources: Vec<LogSourceDef>,

    #[serde(default = "default_config_sources")]
    pub config_sources: Vec<ConfigSourceDef>,
}

fn default_sites_file() -> PathBuf {
    PathBuf::from("/etc/sitewatch/sites.list")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/sitewatch/state")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/home/runcloud/outage_reports")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/home/runcloud/logs")
}

fn default_self_log_dir() -> PathBuf {
    PathBuf::from("/var/log/sitewatch")
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_tick_interval() -> u64 {
    300
}

fn default_lock_stale() -> u64 {
    900
}

fn default_sar_binary() -> String {
    "sar".to_string()
}

fn default_sa_dir() -> PathBuf {
    PathBuf::from("/var/log/sysstat")
}

fn default_perf_metrics() -> Vec<PerfMetricDef> {
    [("cpu_usage", "-u"), ("memory_usage", "-r"), ("load_average", "-q")]
        .iter()
        .map(|(name, flag)| PerfMetricDef {
            name: name.to_string(),
            flag: flag.to_string(),
        })
        .collect()
}

fn default_log_sources() -> Vec<LogSourceDef> {
    vec![
        LogSourceDef {
            name: "nginx_access".to_string(),
            candidates: vec![
                "{log_dir}/{site}_nginx_access.log".to_string(),
                "/var/log/nginx/{site}.access.log".to_string(),
                "/var/log/nginx/access.log".to_string(),
            ],
            regex: r"\[(.*?)\]".to_string(),
            format: "%d/%b/%Y:%H:%M:%S %z".to_string(),
        },
        LogSourceDef {
            name: "nginx_error".to_string(),
            candidates: vec![
                "{log_dir}/{site}_nginx_error.log".to_string(),
                "/var/log/nginx/{site}.error.log".to_string(),
                "/var/log/nginx/error.log".to_string(),
            ],
            regex: r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})".to_string(),
            format: "%Y/%m/%d %H:%M:%S".to_string(),
        },
        LogSourceDef {
            name: "php_fpm_slow".to_string(),
            candidates: vec![
                "/var/log/php/php{runtime}-fpm-slow.log".to_string(),
                "{log_dir}/{site}_php_slow.log".to_string(),
                "/var/log/php{runtime}-fpm-slow.log".to_string(),
            ],
            regex: r"^\[(\d{2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2}:\d{2})\]".to_string(),
            format: "%d-%b-%Y %H:%M:%S".to_string(),
        },
    ]
}

fn default_config_sources() -> Vec<ConfigSourceDef> {
    vec![
        ConfigSourceDef {
            kind: "nginx_config".to_string(),
            candidates: vec![
                "/etc/nginx-rc/conf.d/{site}.conf".to_string(),
                "/etc/nginx/sites-enabled/{site}.conf".to_string(),
                "/etc/nginx/sites-enabled/{site}".to_string(),
                "/etc/nginx/conf.d/{site}.conf".to_string(),
            ],
        },
        ConfigSourceDef {
            kind: "php_fpm_config".to_string(),
            candidates: vec![
                "/etc/php-rc/{runtime}/fpm/pool.d/{site}.conf".to_string(),
                "/etc/php/{runtime}/fpm/pool.d/{site}.conf".to_string(),
            ],
        },
        ConfigSourceDef {
            kind: "php_ini".to_string(),
            candidates: vec![
                "{root}/.user.ini".to_string(),
                "/etc/php-rc/{runtime}/etc/php.ini".to_string(),
                "/etc/php/{runtime}/fpm/php.ini".to_string(),
            ],
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites_file: default_sites_file(),
            state_dir: default_state_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            self_log_dir: default_self_log_dir(),
            probe_timeout_secs: default_probe_timeout(),
            tick_interval_secs: default_tick_interval(),
            lock_stale_secs: default_lock_stale(),
            sar_binary: default_sar_binary(),
            sa_dir: default_sa_dir(),
            perf_metrics: default_perf_metrics(),
            log_sources: default_log_sources(),
            config_sources: default_config_sources(),
        }
    }
}

impl Config {
    /// Load config from the standard locations, falling back to defaults.
    ///
    /// Returns where the config came from so it can be logged once logging is up.
    pub fn load() -> (Self, ConfigOrigin) {
        let mut last_error = String::new();
        for path in [CONFIG_PATH, DEFAULT_CONFIG_PATH] {
            match Self::load_from_path(Path::new(path)) {
                Ok(config) => return (config, ConfigOrigin::File(PathBuf::from(path))),
                Err(e) => last_error = format!("{}: {}", path, e),
            }
        }
        (Config::default(), ConfigOrigin::Defaults(last_error))
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.probe_timeout_secs == 0 {
            return Err(WatchError::Config("probe_timeout_secs must be > 0".to_string()));
        }
        // Source names become report path components
        let names = self
            .log_sources
            .iter()
            .map(|s| ("log source", &s.name))
            .chain(self.config_sources.iter().map(|s| ("config source", &s.kind)))
            .chain(self.perf_metrics.iter().map(|m| ("perf metric", &m.name)));
        for (what, name) in names {
            if !is_valid_site_name(name) {
                return Err(WatchError::Config(format!(
                    "{} name '{}' is not a plain file name",
                    what, name
                )));
            }
        }
        for source in &self.log_sources {
            regex::Regex::new(&source.regex).map_err(|e| {
                WatchError::Config(format!("log source {}: bad regex: {}", source.name, e))
            })?;
            if source.candidates.is_empty() {
                return Err(WatchError::Config(format!(
                    "log source {} has no candidates",
                    source.name
                )));
            }
        }
        for source in &self.config_sources {
            if source.candidates.is_empty() {
                return Err(WatchError::Config(format!(
                    "config source {} has no candidates",
                    source.kind
                )));
            }
        }
        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("transitions.log")
    }

    pub fn self_log_path(&self) -> PathBuf {
        self.self_log_dir.join("sitewatch.log")
    }
}
