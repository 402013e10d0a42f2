use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transfer_protocol::JobStatus;

use crate::config::{lock_path_for, write_atomically, TransferSettings};
use crate::error::{TransferError, TransferResult};
use crate::job::Job;
use crate::lockfile::with_lock;
use crate::queue::QueueSet;

/// Bumped when the on-disk record shape changes
pub const QUEUE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    jobs: BTreeMap<String, Job>,
}

/// JSON file holding every unfinished job across restarts
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    lock_timeout: Duration,
    lock_stale_after: Duration,
}

impl QueueStore {
    pub fn open(path: impl Into<PathBuf>, settings: &TransferSettings) -> Self {
        Self {
            path: path.into(),
            lock_timeout: settings.lock_timeout(),
            lock_stale_after: settings.lock_stale_after(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every unfinished job. Finished and duplicated ones are dropped.
    /// Returns how many records were written.
    pub fn save<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> TransferResult<usize> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            jobs: jobs
                .into_iter()
                .filter(|j| !j.status.is_done())
                .map(|j| (j.id.clone(), j.clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&file)?;
        with_lock(
            &lock_path_for(&self.path),
            self.lock_timeout,
            self.lock_stale_after,
            || {
                write_atomically(&self.path, &body).map_err(|e| {
                    TransferError::Persistence(format!(
                        "Failed to write {}: {}",
                        self.path.display(),
                        e
                    ))
                })
            },
        )?;
        info!(
            "queue_saved: {} records={}",
            self.path.display(),
            file.jobs.len()
        );
        Ok(file.jobs.len())
    }

    /// Read the queue file in submission order. Jobs that were mid-transfer
    /// when the process died come back Stopped with their bytes intact.
    pub fn load(&self) -> TransferResult<Vec<Job>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TransferError::Persistence(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let file = match serde_json::from_str::<QueueFile>(&text) {
            Ok(file) if file.version == QUEUE_FILE_VERSION => file,
            Ok(file) => {
                self.quarantine(&format!("unsupported version {}", file.version));
                return Ok(Vec::new());
            }
            Err(e) => {
                self.quarantine(&e.to_string());
                return Ok(Vec::new());
            }
        };

        let mut jobs: Vec<Job> = file
            .jobs
            .into_values()
            .filter(|j| !j.status.is_done())
            .map(|mut job| {
                if job.status.is_active() {
                    if let Err(e) = job.transition(JobStatus::Stopped) {
                        warn!("queue_load_interrupted: {} error={}", job.id, e);
                    }
                }
                job
            })
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        info!(
            "queue_loaded: {} records={}",
            self.path.display(),
            jobs.len()
        );
        Ok(jobs)
    }

    /// Move an unreadable file aside so the next save starts clean
    fn quarantine(&self, reason: &str) {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        let aside = self.path.with_file_name(name);
        error!(
            "queue_file_corrupt: {} reason={} moved_to={}",
            self.path.display(),
            reason,
            aside.display()
        );
        if let Err(e) = std::fs::rename(&self.path, &aside) {
            warn!("queue_quarantine_failed: {} error={}", aside.display(), e);
        }
    }

    /// Load and put every job back on its direction's queue
    pub fn rehydrate(&self, queues: &QueueSet) -> TransferResult<usize> {
        let mut restored = 0;
        for job in self.load()? {
            let id = job.id.clone();
            match queues.get(job.direction()).restore(job) {
                Ok(entry) if entry.is_added() => restored += 1,
                Ok(_) => {}
                Err(e) => warn!("queue_restore_skipped: {} error={}", id, e),
            }
        }
        info!("queue_rehydrated: restored={}", restored);
        Ok(restored)
    }
}
