//! Filesystem change collector
//!
//! Finds every regular file under the site root whose mtime falls inside the
//! outage window and copies it into the report, preserving relative paths.
//!
//! Rules:
//! - Symlinks are never followed, so nothing outside the root is read
//! - A file that vanishes (or is swapped) between scan and copy is skipped
//! - A file that exists but cannot be copied is listed as failed, not dropped
//! - Directories in `exclude` (the report output) are not scanned

use super::{ArtifactStatus, MANIFEST_FILE, MODIFIED_DIR};
use crate::error::WatchError;
use crate::outage::OutageInterval;
use crate::timefmt::{serde_ts, system_time_to_local};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A file found by the scan
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: NaiveDateTime,
    mtime: SystemTime,
    dev: u64,
    ino: u64,
}

/// Copied file record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: PathBuf,
    pub size: u64,
    #[serde(with = "serde_ts")]
    pub modified: NaiveDateTime,
    pub sha256: String,
}

/// File that qualified but could not be copied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCopy {
    pub relative_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub root: PathBuf,
    #[serde(with = "serde_ts")]
    pub window_start: NaiveDateTime,
    #[serde(with = "serde_ts")]
    pub window_end: NaiveDateTime,
    pub entries: Vec<ManifestEntry>,
    pub failed: Vec<FailedCopy>,
    /// Qualified at scan time, gone (or replaced) by copy time
    pub vanished: Vec<PathBuf>,
}

/// Enumerate regular files under `root` modified inside the interval.
///
/// `root` should already be canonical. Unreadable subtrees are skipped.
pub fn find_modified(
    root: &Path,
    interval: &OutageInterval,
    exclude: &[PathBuf],
) -> io::Result<Vec<ChangedFile>> {
    // Surface a missing or unreadable root instead of returning an empty scan
    fs::read_dir(root)?;

    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| e.path().starts_with(x)));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("[SNAPSHOT] Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        // Lstat; the entry may already be gone
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("[SNAPSHOT] {} vanished during scan: {}", entry.path().display(), e);
                continue;
            }
        };
        let Ok(mtime) = metadata.modified() else {
            continue;
        };
        let Some(modified) = system_time_to_local(mtime) else {
            warn!(
                "[SNAPSHOT] Skipping {}: modification time out of range",
                entry.path().display()
            );
            continue;
        };
        if !interval.contains(&modified) {
            continue;
        }

        let Some(relative_path) = contained_relative(root, entry.path()) else {
            warn!("[SNAPSHOT] Refusing path outside root: {}", entry.path().display());
            continue;
        };

        found.push(ChangedFile {
            path: entry.path().to_path_buf(),
            relative_path,
            size: metadata.len(),
            modified,
            mtime,
            dev: metadata.dev(),
            ino: metadata.ino(),
        });
    }

    found.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(found)
}

/// Relative path of `path` under `root`, made only of normal components
fn contained_relative(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Copy one scanned file into `dest_root`, hashing as it goes.
fn copy_changed(file: &ChangedFile, dest_root: &Path) -> Result<ManifestEntry, WatchError> {
    let mut src = match File::open(&file.path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(WatchError::FilesystemRace(file.path.clone()))
        }
        Err(e) => return Err(e.into()),
    };

    // open() follows symlinks: make sure it is still the file the scan saw
    let opened = src.metadata()?;
    if !opened.is_file() || opened.dev() != file.dev || opened.ino() != file.ino {
        return Err(WatchError::FilesystemRace(file.path.clone()));
    }

    let dest = dest_root.join(&file.relative_path);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(&dest)?;

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        size += n as u64;
    }
    out.flush()?;
    // Keep the original mtime on the copy
    let _ = out.set_modified(file.mtime);

    Ok(ManifestEntry {
        relative_path: file.relative_path.clone(),
        size,
        modified: file.modified,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Scan, copy, and write the manifest. Returns the artifact status and the
/// manifest (when the root could be scanned).
pub fn collect_modified_files(
    root: &Path,
    interval: &OutageInterval,
    report_dir: &Path,
    exclude: &[PathBuf],
) -> (ArtifactStatus, Option<Manifest>) {
    if !root.exists() {
        warn!("[SNAPSHOT] Application path does not exist: {}", root.display());
        return (
            ArtifactStatus::NotFound {
                reason: "application path not found".to_string(),
                tried: vec![root.to_path_buf()],
            },
            None,
        );
    }
    let canonical_root = match fs::canonicalize(root) {
        Ok(p) if p.is_dir() => p,
        Ok(p) => {
            return (
                ArtifactStatus::failed(format!("{} is not a directory", p.display())),
                None,
            )
        }
        Err(e) => {
            return (
                ArtifactStatus::failed(format!("resolving {}: {}", root.display(), e)),
                None,
            )
        }
    };

    let changed = match find_modified(&canonical_root, interval, exclude) {
        Ok(c) => c,
        Err(e) => {
            return (
                ArtifactStatus::failed(format!("scanning {}: {}", canonical_root.display(), e)),
                None,
            )
        }
    };
    info!(
        "[SNAPSHOT] Found {} file(s) modified under {}",
        changed.len(),
        canonical_root.display()
    );

    let (status, manifest) = record_changes(canonical_root, interval, &changed, report_dir);
    (status, Some(manifest))
}

/// Copy scanned files into the report and write the manifest. Files gone or
/// replaced since the scan are listed as vanished.
fn record_changes(
    root: PathBuf,
    interval: &OutageInterval,
    changed: &[ChangedFile],
    report_dir: &Path,
) -> (ArtifactStatus, Manifest) {
    let mut manifest = Manifest {
        root,
        window_start: interval.started_at,
        window_end: interval.ended_at,
        entries: Vec::new(),
        failed: Vec::new(),
        vanished: Vec::new(),
    };

    let dest_root = report_dir.join(MODIFIED_DIR);
    for file in changed {
        match copy_changed(file, &dest_root) {
            Ok(entry) => manifest.entries.push(entry),
            Err(WatchError::FilesystemRace(path)) => {
                debug!("[SNAPSHOT] {} vanished before copy", path.display());
                manifest.vanished.push(file.relative_path.clone());
            }
            Err(e) => {
                warn!("[SNAPSHOT] Could not copy {}: {}", file.path.display(), e);
                manifest.failed.push(FailedCopy {
                    relative_path: file.relative_path.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let json = match serde_json::to_string_pretty(&manifest) {
        Ok(j) => j,
        Err(e) => return (ArtifactStatus::failed(e), manifest),
    };
    let manifest_path = report_dir.join(MANIFEST_FILE);
    if let Err(e) = fs::write(&manifest_path, json.as_bytes()) {
        return (
            ArtifactStatus::failed(format!("writing {}: {}", manifest_path.display(), e)),
            manifest,
        );
    }

    let status = ArtifactStatus::Collected {
        location: PathBuf::from(MANIFEST_FILE),
        source: Some(manifest.root.clone()),
        bytes: manifest.entries.iter().map(|e| e.size).sum(),
        lines: Some(manifest.entries.len()),
    };
    (status, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timefmt::{now_local, parse_timestamp};
    use chrono::Duration;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, at: &str) {
        let local = parse_timestamp(at)
            .unwrap()
            .and_local_timezone(chrono::Local)
            .single()
            .unwrap();
        let t: SystemTime = local.into();
        File::options().write(true).open(path).unwrap().set_modified(t).unwrap();
    }

    fn window() -> OutageInterval {
        OutageInterval::new(
            "app1",
            parse_timestamp("2024-05-01 10:00:00").unwrap(),
            parse_timestamp("2024-05-01 10:10:00").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_only_files_inside_window() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("wp-content/uploads")).unwrap();
        for (name, at) in [
            ("index.php", "2024-05-01 09:59:59"),
            ("wp-config.php", "2024-05-01 10:00:00"),
            ("wp-content/uploads/shell.php", "2024-05-01 10:05:00"),
            ("wp-content/cache.tmp", "2024-05-01 10:10:00"),
            ("late.log", "2024-05-01 10:10:01"),
        ] {
            let p = root.path().join(name);
            fs::write(&p, name).unwrap();
            set_mtime(&p, at);
        }

        let canonical = fs::canonicalize(root.path()).unwrap();
        let found = find_modified(&canonical, &window(), &[]).unwrap();
        let rels: Vec<_> = found.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("wp-config.php"),
                PathBuf::from("wp-content/cache.tmp"),
                PathBuf::from("wp-content/uploads/shell.php"),
            ]
        );
    }

    #[test]
    fn test_symlinks_not_followed() {
        let outside = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        fs::create_dir(outside.path().join("dir")).unwrap();
        fs::write(outside.path().join("dir/inner.txt"), "inner").unwrap();
        symlink(outside.path().join("secret.txt"), root.path().join("link.txt")).unwrap();
        symlink(outside.path().join("dir"), root.path().join("linkdir")).unwrap();
        fs::write(root.path().join("real.txt"), "real").unwrap();

        let now = now_local();
        let interval =
            OutageInterval::new("app1", now - Duration::hours(1), now + Duration::hours(1))
                .unwrap();
        let canonical = fs::canonicalize(root.path()).unwrap();
        let found = find_modified(&canonical, &interval, &[]).unwrap();
        let rels: Vec<_> = found.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(rels, vec![PathBuf::from("real.txt")]);
    }

    #[test]
    fn test_vanished_file_skipped_not_failed() {
        let root = TempDir::new().unwrap();
        let report = TempDir::new().unwrap();
        fs::write(root.path().join("keep.php"), "keep").unwrap();
        fs::write(root.path().join("gone.php"), "gone").unwrap();

        let now = now_local();
        let interval =
            OutageInterval::new("app1", now - Duration::hours(1), now + Duration::hours(1))
                .unwrap();
        let canonical = fs::canonicalize(root.path()).unwrap();
        let found = find_modified(&canonical, &interval, &[]).unwrap();
        assert_eq!(found.len(), 2);

        fs::remove_file(root.path().join("gone.php")).unwrap();
        let dest = report.path().join(MODIFIED_DIR);
        let results: Vec<_> = found.iter().map(|f| copy_changed(f, &dest)).collect();
        let gone = results
            .iter()
            .zip(&found)
            .find(|(_, f)| f.relative_path == PathBuf::from("gone.php"))
            .unwrap();
        assert!(matches!(gone.0, Err(WatchError::FilesystemRace(_))));

        let keep = found
            .iter()
            .find(|f| f.relative_path == PathBuf::from("keep.php"))
            .unwrap();
        let entry = copy_changed(keep, &dest).unwrap();
        assert_eq!(entry.size, 4);
        assert_eq!(
            entry.sha256,
            "6ca7ea2feefc88ecb5ed6356ed963f47dc9137f82526fdd25d618ea626d0803f"
        );
    }

    #[test]
    fn test_vanished_file_left_out_of_manifest() {
        let root = TempDir::new().unwrap();
        let report = TempDir::new().unwrap();
        fs::write(root.path().join("keep.php"), "keep").unwrap();
        fs::write(root.path().join("gone.php"), "gone").unwrap();

        let now = now_local();
        let interval =
            OutageInterval::new("app1", now - Duration::hours(1), now + Duration::hours(1))
                .unwrap();
        let canonical = fs::canonicalize(root.path()).unwrap();
        let found = find_modified(&canonical, &interval, &[]).unwrap();
        fs::remove_file(root.path().join("gone.php")).unwrap();

        let (status, manifest) = record_changes(canonical, &interval, &found, report.path());
        assert!(status.is_collected());
        let entries: Vec<_> = manifest.entries.iter().map(|e| e.relative_path.clone()).collect();
        assert_eq!(entries, vec![PathBuf::from("keep.php")]);
        assert_eq!(manifest.vanished, vec![PathBuf::from("gone.php")]);
        assert!(manifest.failed.is_empty());

        let on_disk: Manifest =
            serde_json::from_str(&fs::read_to_string(report.path().join(MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(on_disk, manifest);
        assert!(!report.path().join(MODIFIED_DIR).join("gone.php").exists());
    }

    #[test]
    fn test_out_of_range_mtime_does_not_abort_scan() {
        let root = TempDir::new().unwrap();
        let report = TempDir::new().unwrap();
        fs::write(root.path().join("normal.php"), "ok").unwrap();
        let odd = root.path().join("odd.php");
        fs::write(&odd, "odd").unwrap();
        // Filesystems with a narrower range clamp this; either way it is not in the window
        File::options()
            .write(true)
            .open(&odd)
            .unwrap()
            .set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(1 << 50))
            .unwrap();

        let now = now_local();
        let interval =
            OutageInterval::new("app1", now - Duration::hours(1), now + Duration::hours(1))
                .unwrap();
        let (status, manifest) = collect_modified_files(root.path(), &interval, report.path(), &[]);

        assert!(status.is_collected());
        let entries: Vec<_> = manifest
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.relative_path)
            .collect();
        assert_eq!(entries, vec![PathBuf::from("normal.php")]);
    }

    #[test]
    fn test_excluded_output_dir_not_scanned() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("reports/old")).unwrap();
        fs::write(root.path().join("reports/old/summary.json"), "{}").unwrap();
        fs::write(root.path().join("app.php"), "x").unwrap();

        let now = now_local();
        let interval =
            OutageInterval::new("app1", now - Duration::hours(1), now + Duration::hours(1))
                .unwrap();
        let canonical = fs::canonicalize(root.path()).unwrap();
        let found = find_modified(&canonical, &interval, &[canonical.join("reports")]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].relative_path, PathBuf::from("app.php"));
    }

    #[test]
    fn test_missing_root_is_not_found() {
        let report = TempDir::new().unwrap();
        let (status, manifest) = collect_modified_files(
            Path::new("/nonexistent/sitewatch/app"),
            &window(),
            report.path(),
            &[],
        );
        assert!(matches!(status, ArtifactStatus::NotFound { .. }));
        assert!(manifest.is_none());
    }

    #[test]
    fn test_contained_relative_rejects_escape() {
        let root = Path::new("/srv/app");
        assert_eq!(
            contained_relative(root, Path::new("/srv/app/a/b.php")),
            Some(PathBuf::from("a/b.php"))
        );
        assert_eq!(contained_relative(root, Path::new("/srv/app")), None);
        assert_eq!(contained_relative(root, Path::new("/srv/other/x")), None);
        assert_eq!(contained_relative(root, Path::new("/srv/app/../x")), None);
    }
}
