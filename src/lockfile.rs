//! Exclusive-access lock file guarding the settings store and the queue file
//! against a second process instance writing at the same time.
//!
//! The lock is a file created with `create_new`; holding it means owning the
//! guard. Release happens on drop, so early returns and errors cannot leave it
//! behind. A lock older than `stale_after` was left by a crashed process and
//! gets broken.

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{TransferError, TransferResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: String,
}

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Block until the lock is ours or `timeout` runs out
    pub fn acquire(path: &Path, timeout: Duration, stale_after: Duration) -> TransferResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_create(path) {
                Ok(()) => {
                    debug!("lock_acquired: {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(path, stale_after) {
                        Self::break_stale(path, stale_after);
                        continue;
                    }
                }
                Err(e) => {
                    return Err(TransferError::Lock(format!(
                        "Failed to create {}: {}",
                        path.display(),
                        e
                    )))
                }
            }

            if Instant::now() >= deadline {
                return Err(TransferError::Lock(format!(
                    "Timed out waiting for {}",
                    path.display()
                )));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    fn try_create(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let owner = LockOwner {
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_vec(&owner).map_err(io::Error::other)?;
        file.write_all(&body)?;
        Ok(())
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // Vanished between create and stat; the next attempt will win.
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= stale_after)
            .unwrap_or(false)
    }

    /// Move the lock aside before deleting it. Another process may have
    /// broken the same lock and taken a fresh one since `is_stale` looked, so
    /// the moved file is checked again and put back if it turns out fresh.
    /// Returns whether a stale lock was removed.
    fn break_stale(path: &Path, stale_after: Duration) -> bool {
        let mut name = path.as_os_str().to_os_string();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        name.push(format!(".stale-{}-{}", std::process::id(), nanos));
        let aside = PathBuf::from(name);

        if let Err(e) = fs::rename(path, &aside) {
            // Already gone: someone else broke it first.
            debug!("lock_break_skipped: {} error={}", path.display(), e);
            return false;
        }
        if Self::is_stale(&aside, stale_after) {
            warn!("lock_stale: broke {}", path.display());
            let _ = fs::remove_file(&aside);
            return true;
        }

        match fs::hard_link(&aside, path) {
            Ok(()) => debug!("lock_restored: {}", path.display()),
            Err(e) => warn!("lock_restore_failed: {} error={}", path.display(), e),
        }
        let _ = fs::remove_file(&aside);
        false
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("lock_release_failed: {} error={}", self.path.display(), e);
        } else {
            debug!("lock_released: {}", self.path.display());
        }
    }
}

/// Run `f` while holding the lock at `path`
pub fn with_lock<T>(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
    f: impl FnOnce() -> TransferResult<T>,
) -> TransferResult<T> {
    let _guard = LockFile::acquire(path, timeout, stale_after)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(600);

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.lock");

        let held = LockFile::acquire(&path, Duration::from_millis(100), STALE).unwrap();
        assert!(path.exists());

        let err = LockFile::acquire(&path, Duration::from_millis(60), STALE).unwrap_err();
        assert!(matches!(err, TransferError::Lock(_)));

        drop(held);
        assert!(!path.exists());
        assert!(LockFile::acquire(&path, Duration::from_millis(100), STALE).is_ok());
    }

    #[test]
    fn lock_is_released_when_closure_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.lock");

        let result: TransferResult<()> = with_lock(&path, Duration::from_millis(100), STALE, || {
            Err(TransferError::Persistence("disk full".to_string()))
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashed.lock");
        fs::write(&path, b"{\"pid\":1,\"acquired_at\":\"then\"}").unwrap();

        let lock = LockFile::acquire(&path, Duration::from_millis(100), Duration::ZERO).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[test]
    fn fresh_lock_taken_after_the_stale_check_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.lock");
        // Another process broke the old lock and holds a new one by the time
        // this one gets around to breaking it.
        let held = LockFile::acquire(&path, Duration::from_millis(100), STALE).unwrap();
        let body = fs::read(&path).unwrap();

        assert!(!LockFile::break_stale(&path, STALE));
        assert_eq!(fs::read(&path).unwrap(), body);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let err = LockFile::acquire(&path, Duration::from_millis(60), STALE).unwrap_err();
        assert!(matches!(err, TransferError::Lock(_)));
        drop(held);
        assert!(!path.exists());
    }

    #[test]
    fn breaking_leaves_no_aside_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashed.lock");
        fs::write(&path, b"{\"pid\":1,\"acquired_at\":\"then\"}").unwrap();

        assert!(LockFile::break_stale(&path, Duration::ZERO));
        assert!(!LockFile::break_stale(&path, Duration::ZERO));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
