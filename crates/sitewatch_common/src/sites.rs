//! Site list loading
//!
//! One site per line: `name runtimeVersion rootPath url`.
//! Blank lines and `#` comments are ignored. A bad line is reported and
//! skipped; it never stops the rest of the file from loading.

use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A monitored site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    pub name: String,
    pub runtime_version: String,
    pub root_path: PathBuf,
    pub url: String,
}

/// Result of loading the site list
#[derive(Debug, Default)]
pub struct SiteList {
    pub sites: Vec<SiteDescriptor>,
    pub skipped: Vec<WatchError>,
}

/// Read and parse the site list. Only failure to read the file is an error.
pub fn load_sites(path: &Path) -> Result<SiteList> {
    let content = fs::read_to_string(path).map_err(|source| WatchError::SiteListRead {
        path: path.to_path_buf(),
        source,
    })?;

    let list = parse_sites(&content);
    for err in &list.skipped {
        warn!("[SITES] {}", err);
    }
    debug!(
        "[SITES] Loaded {} site(s) from {} ({} line(s) skipped)",
        list.sites.len(),
        path.display(),
        list.skipped.len()
    );
    Ok(list)
}

pub fn parse_sites(content: &str) -> SiteList {
    let mut list = SiteList::default();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line, line_no) {
            Ok(site) => {
                if !seen.insert(site.name.clone()) {
                    list.skipped.push(WatchError::ConfigLine {
                        line: line_no,
                        reason: format!("duplicate site name '{}'", site.name),
                    });
                    continue;
                }
                list.sites.push(site);
            }
            Err(e) => list.skipped.push(e),
        }
    }

    list
}

fn parse_line(line: &str, line_no: usize) -> Result<SiteDescriptor> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(WatchError::ConfigLine {
            line: line_no,
            reason: format!("expected 4 fields, found {}", fields.len()),
        });
    }

    let name = fields[0];
    if !is_valid_site_name(name) {
        return Err(WatchError::ConfigLine {
            line: line_no,
            reason: format!("'{}' is not a usable site name", name),
        });
    }

    let root_path = PathBuf::from(fields[2]);
    if !root_path.is_absolute() {
        return Err(WatchError::ConfigLine {
            line: line_no,
            reason: format!("root path '{}' must be absolute", fields[2]),
        });
    }

    let url = fields[3];
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(WatchError::ConfigLine {
            line: line_no,
            reason: format!("url '{}' must be http or https", url),
        });
    }

    Ok(SiteDescriptor {
        name: name.to_string(),
        runtime_version: fields[1].to_string(),
        root_path,
        url: url.to_string(),
    })
}

/// Site names become file names for state, locks, and reports.
pub fn is_valid_site_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
