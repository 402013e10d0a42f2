use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use transfer_protocol::Direction;

use crate::error::{TransferError, TransferResult};
use crate::lockfile::with_lock;

/// Write buffer / progress flush size (2 MB)
pub const DEFAULT_PROGRESS_CHUNK_BYTES: u64 = 2 * 1024 * 1024;

/// Read/write chunk for local streaming (256 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Tunables for queues, workers and persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSettings {
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub remote_concurrency: usize,
    /// Extra attempts for transient failures before a job is marked failed
    pub retry_cap: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub progress_interval_ms: u64,
    pub progress_chunk_bytes: u64,
    pub chunk_size: usize,
    /// No progress for this long aborts the attempt as a timeout
    pub idle_timeout_ms: u64,
    pub persist_interval_ms: u64,
    /// Finished jobs older than this are dropped automatically
    pub retention_secs: Option<u64>,
    pub lock_timeout_ms: u64,
    pub lock_stale_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            upload_concurrency: 3,
            download_concurrency: 3,
            remote_concurrency: 5,
            retry_cap: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            progress_interval_ms: 250,
            progress_chunk_bytes: DEFAULT_PROGRESS_CHUNK_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout_ms: 60_000,
            persist_interval_ms: 1_000,
            retention_secs: None,
            lock_timeout_ms: 5_000,
            lock_stale_secs: 120,
        }
    }
}

impl TransferSettings {
    pub fn concurrency(&self, direction: Direction) -> usize {
        match direction {
            Direction::Upload => self.upload_concurrency,
            Direction::Download => self.download_concurrency,
            Direction::Remote => self.remote_concurrency,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn validate(&self) -> TransferResult<()> {
        for direction in Direction::ALL {
            if self.concurrency(direction) == 0 {
                return Err(TransferError::Config(format!(
                    "{} concurrency must be at least 1",
                    direction
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(TransferError::Config(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(TransferError::Config(
                "backoff_max_ms must not be below backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Load settings; a missing file yields defaults
    pub fn load(path: &Path) -> TransferResult<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<Self>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(TransferError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings while holding the store lock
    pub fn save(&self, path: &Path) -> TransferResult<()> {
        self.validate()?;
        let body = serde_json::to_vec_pretty(self)?;
        with_lock(
            &lock_path_for(path),
            self.lock_timeout(),
            self.lock_stale_after(),
            || {
                write_atomically(path, &body)
                    .map_err(|e| TransferError::Config(format!("Failed to write settings: {}", e)))
            },
        )?;
        info!("settings_saved: {}", path.display());
        Ok(())
    }
}

/// `<file>.lock` next to the guarded file
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Write to a sibling temp file, then rename over the target
pub(crate) fn write_atomically(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
