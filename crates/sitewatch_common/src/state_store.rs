//! Outage state store
//!
//! One JSON document per site under the state directory. Writes go through a
//! temp file + rename so a crash never leaves a half-written record, and a
//! record outlives the process that wrote it.

use crate::error::{Result, WatchError};
use crate::outage::OutageState;
use crate::sites::is_valid_site_name;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Durable key-value store of active outages, keyed by site name
pub trait StateStore: Send + Sync {
    fn load(&self, site: &str) -> Result<Option<OutageState>>;
    fn save(&self, state: &OutageState) -> Result<()>;
    fn remove(&self, site: &str) -> Result<()>;
    fn list_active(&self) -> Result<Vec<OutageState>>;
}

/// File-backed store: `{dir}/{site}.json`
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, site: &str) -> Result<PathBuf> {
        if !is_valid_site_name(site) {
            return Err(WatchError::Config(format!("invalid site key '{}'", site)));
        }
        Ok(self.dir.join(format!("{}.json", site)))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, site: &str) -> Result<Option<OutageState>> {
        let path = self.record_path(site)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: OutageState = serde_json::from_str(&content)?;
        Ok(Some(state))
    }

    fn save(&self, state: &OutageState) -> Result<()> {
        let path = self.record_path(&state.site)?;
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&path, json.as_bytes())?;
        Ok(())
    }

    fn remove(&self, site: &str) -> Result<()> {
        let path = self.record_path(site)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_active(&self) -> Result<Vec<OutageState>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut active = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(WatchError::from)
                .and_then(|c| serde_json::from_str::<OutageState>(&c).map_err(WatchError::from))
            {
                Ok(state) => active.push(state),
                Err(e) => warn!("[STATE] Ignoring unreadable record {}: {}", path.display(), e),
            }
        }
        active.sort_by(|a, b| a.site.cmp(&b.site));
        Ok(active)
    }
}

/// Write data to a file atomically using temp file + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::parse_timestamp;
    use tempfile::TempDir;

    fn state(site: &str, at: &str) -> OutageState {
        OutageState {
            site: site.to_string(),
            started_at: parse_timestamp(at).unwrap(),
        }
    }

    #[test]
    fn test_absent_until_saved() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));
        assert_eq!(store.load("app1").unwrap(), None);
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn test_survives_a_new_store_instance() {
        let dir = TempDir::new().unwrap();
        let s = state("app1", "2024-05-01 10:00:00");
        FileStateStore::new(dir.path()).save(&s).unwrap();

        // A fresh instance stands in for a restarted process
        let reopened = FileStateStore::new(dir.path());
        assert_eq!(reopened.load("app1").unwrap(), Some(s));
        assert!(!dir.path().join("app1.tmp").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&state("app1", "2024-05-01 10:00:00")).unwrap();
        store.remove("app1").unwrap();
        store.remove("app1").unwrap();
        assert_eq!(store.load("app1").unwrap(), None);
    }

    #[test]
    fn test_list_active_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&state("b", "2024-05-01 10:00:00")).unwrap();
        store.save(&state("a", "2024-05-01 09:00:00")).unwrap();
        fs::write(dir.path().join("junk.json"), "{not json").unwrap();
        fs::write(dir.path().join("transitions.log"), "x").unwrap();

        let active = store.list_active().unwrap();
        let names: Vec<_> = active.iter().map(|s| s.site.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("../etc/passwd").is_err());
    }
}
