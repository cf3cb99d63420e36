//! Per-site lock files
//!
//! Serializes work on one site across overlapping processes (two cron ticks,
//! or a tick racing a detached snapshot):
//! - Lock file holds owner PID, purpose, and acquisition time
//! - Published with a hard link, so a lock file is never seen half-written
//! - A lock whose owner is gone, or that is older than the stale age, is reclaimed
//! - Released on drop

use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// An unreadable lock younger than this is assumed to belong to a live writer
const UNREADABLE_GRACE_SECS: u64 = 10;

/// Publish attempts before giving up on a contended lock
const ACQUIRE_ROUNDS: usize = 3;

/// Lock file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    /// Unix epoch seconds
    pub acquired_at: u64,
    pub purpose: String,
}

impl LockInfo {
    fn new(purpose: &str) -> Self {
        Self {
            pid: process::id(),
            acquired_at: epoch_secs(),
            purpose: purpose.to_string(),
        }
    }

    fn age_secs(&self) -> u64 {
        epoch_secs().saturating_sub(self.acquired_at)
    }

    fn process_exists(&self) -> bool {
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What is currently sitting at a lock path
#[derive(Debug)]
enum Holder {
    /// Removed since we looked
    Gone,
    Held { pid: u32 },
    Reclaimable { stale: StaleLock, reason: String },
}

/// Identity of the exact file judged stale. Inode numbers are reused once a
/// file is freed, so the content is compared as well.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StaleLock {
    ino: u64,
    content: String,
}

fn inspect(path: &Path, stale_secs: u64) -> io::Result<Holder> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Holder::Gone),
        Err(e) => return Err(e),
    };
    let meta = file.metadata()?;
    let content = io::read_to_string(file)?;

    match serde_json::from_str::<LockInfo>(&content) {
        Ok(info) if info.process_exists() && info.age_secs() <= stale_secs => {
            Ok(Holder::Held { pid: info.pid })
        }
        Ok(info) => Ok(Holder::Reclaimable {
            reason: format!("stale lock (pid={} age={}s)", info.pid, info.age_secs()),
            stale: StaleLock {
                ino: meta.ino(),
                content,
            },
        }),
        Err(_) => {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if age < UNREADABLE_GRACE_SECS {
                Ok(Holder::Held { pid: 0 })
            } else {
                Ok(Holder::Reclaimable {
                    reason: format!("unreadable lock ({}s old)", age),
                    stale: StaleLock {
                        ino: meta.ino(),
                        content,
                    },
                })
            }
        }
    }
}

/// Write `info` to a private temp file and link it into place. Fails with
/// `AlreadyExists` if any lock is present. Returns the new lock's inode.
fn publish(path: &Path, info: &LockInfo) -> io::Result<u64> {
    let tmp = path.with_extension(format!("lock.{}.tmp", info.pid));
    let result = (|| -> io::Result<u64> {
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string(info)?.as_bytes())?;
        file.sync_all()?;
        let ino = file.metadata()?.ino();
        fs::hard_link(&tmp, path)?;
        Ok(ino)
    })();
    let _ = fs::remove_file(&tmp);
    result
}

/// Move the stale lock aside, but only if it is still the file that was
/// judged stale. A lock published in the meantime is put back.
///
/// Returns true if the stale lock was removed.
fn reclaim(path: &Path, stale: &StaleLock) -> io::Result<bool> {
    let aside = path.with_extension(format!("lock.{}.stale", process::id()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let moved = StaleLock {
        ino: fs::metadata(&aside)?.ino(),
        content: fs::read_to_string(&aside)?,
    };
    if moved == *stale {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    // Took someone's fresh lock; restore it
    let restored = fs::hard_link(&aside, path);
    let _ = fs::remove_file(&aside);
    match restored {
        Ok(()) => Ok(false),
        Err(e) => {
            warn!("[LOCK] Could not restore {}: {}", path.display(), e);
            Err(e)
        }
    }
}

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct SiteLock {
    path: PathBuf,
    ino: u64,
}

impl SiteLock {
    /// Try to take `{dir}/{site}.{purpose}.lock`.
    pub fn acquire(dir: &Path, site: &str, purpose: &str, stale_secs: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}.lock", site, purpose));
        let info = LockInfo::new(purpose);

        for _ in 0..ACQUIRE_ROUNDS {
            match publish(&path, &info) {
                Ok(ino) => {
                    debug!("[LOCK] Acquired {} ({})", path.display(), purpose);
                    return Ok(Self { path, ino });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match inspect(&path, stale_secs)? {
                Holder::Gone => continue,
                Holder::Held { pid } => {
                    return Err(WatchError::SiteLocked {
                        site: site.to_string(),
                        pid,
                    })
                }
                Holder::Reclaimable { stale, reason } => {
                    warn!("[LOCK] Reclaiming {}: {}", path.display(), reason);
                    if !reclaim(&path, &stale)? {
                        debug!("[LOCK] {} changed hands while reclaiming", path.display());
                    }
                }
            }
        }

        Err(WatchError::SiteLocked {
            site: site.to_string(),
            pid: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SiteLock {
    fn drop(&mut self) {
        // Only remove the file we published
        let ours = fs::metadata(&self.path)
            .map(|m| m.ino() == self.ino)
            .unwrap_or(false);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("[LOCK] Failed to release {}: {}", self.path.display(), e);
            }
        }
    }
}
