use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use transfer_protocol::{
    Direction, ErrorKind, JobErrorInfo, JobKind, JobOptions, JobSnapshot, JobStatus, ResumePolicy,
};

use super::state::can_transition;
use crate::error::{TransferError, TransferResult};

/// Where a job's bytes come from and go to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobTarget {
    pub region: String,
    pub bucket: String,
    pub key: String,
    /// Absent for delete and restore
    pub local_path: Option<PathBuf>,
}

/// Stable id from kind and endpoints, so resubmitting the same transfer
/// finds the job already queued.
pub fn derive_job_id(kind: JobKind, target: &JobTarget) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.id_prefix().as_bytes());
    for part in [&target.region, &target.bucket, &target.key] {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hasher.update([0u8]);
    if let Some(local) = &target.local_path {
        hasher.update(local.to_string_lossy().as_bytes());
    }
    let digest = hasher.finalize();
    format!("{}-{}", kind.id_prefix(), hex::encode(&digest[..16]))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub target: JobTarget,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub restore_days: Option<u32>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub status: JobStatus,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    #[serde(default)]
    pub rate_bytes_per_sec: f64,
    #[serde(default)]
    pub error: Option<JobErrorInfo>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind, target: JobTarget, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: derive_job_id(kind, &target),
            kind,
            target,
            options,
            restore_days: None,
            batch_id: None,
            status: JobStatus::Waiting,
            total_bytes: None,
            transferred_bytes: 0,
            rate_bytes_per_sec: 0.0,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the derived id with a random one
    pub fn with_fresh_id(mut self) -> Self {
        self.id = format!("{}-{}", self.kind.id_prefix(), uuid::Uuid::new_v4());
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.total_bytes = total;
        self
    }

    pub fn with_restore_days(mut self, days: u32) -> Self {
        self.restore_days = Some(days);
        self
    }

    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Byte offset a new attempt should start from
    pub fn resume_offset(&self) -> u64 {
        if self.keeps_progress_on_retry() {
            self.transferred_bytes
        } else {
            0
        }
    }

    /// A partial download is worth keeping, a corrupt one is not
    fn keeps_progress_on_retry(&self) -> bool {
        self.kind == JobKind::Download
            && self.options.resume == ResumePolicy::ByteRange
            && self
                .error
                .as_ref()
                .map_or(true, |e| e.kind != ErrorKind::Integrity)
    }

    pub fn transition(&mut self, to: JobStatus) -> TransferResult<()> {
        if !can_transition(self.status, to) {
            return Err(TransferError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to != JobStatus::Failed {
            self.error = None;
        }
        if !to.is_active() {
            self.rate_bytes_per_sec = 0.0;
        }
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, error: JobErrorInfo) -> TransferResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Failed/Stopped -> Waiting. Progress is kept only when the job can
    /// pick up where it left off.
    pub fn reset_for_retry(&mut self) -> TransferResult<()> {
        let keep = self.keeps_progress_on_retry();
        self.transition(JobStatus::Waiting)?;
        if !keep {
            self.transferred_bytes = 0;
        }
        self.retry_count = 0;
        Ok(())
    }

    /// Fold in a progress report. Bytes never go backwards and never pass the
    /// known total. Returns whether anything observable changed.
    pub fn record_progress(&mut self, transferred: u64, total: Option<u64>) -> bool {
        let mut changed = false;
        if let Some(total) = total {
            if self.total_bytes != Some(total) {
                self.total_bytes = Some(total);
                changed = true;
            }
        }
        let clamped = match self.total_bytes {
            Some(total) => transferred.min(total),
            None => transferred,
        };
        if clamped > self.transferred_bytes {
            self.transferred_bytes = clamped;
            changed = true;
        }
        if changed {
            self.touch();
        }
        changed
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            direction: self.direction(),
            status: self.status,
            transferred_bytes: self.transferred_bytes,
            total_bytes: self.total_bytes,
            rate_bytes_per_sec: self.rate_bytes_per_sec,
            error: self.error.clone(),
            retry_count: self.retry_count,
            batch_id: self.batch_id.clone(),
            region: self.target.region.clone(),
            bucket: self.target.bucket.clone(),
            key: self.target.key.clone(),
            local_path: self
                .target
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            created_at: self.created_at.timestamp_millis(),
            updated_at: self.updated_at.timestamp_millis(),
        }
    }
}
