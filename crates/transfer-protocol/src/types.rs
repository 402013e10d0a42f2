//! Job, batch and error vocabulary shared by both sides of the channel

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What a job does with its object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Upload,
    Download,
    Delete,
    Restore,
}

impl JobKind {
    /// Queue lane the job is scheduled on. Delete and restore share one lane.
    pub fn direction(&self) -> Direction {
        match self {
            JobKind::Upload => Direction::Upload,
            JobKind::Download => Direction::Download,
            JobKind::Delete | JobKind::Restore => Direction::Remote,
        }
    }

    /// Short prefix used when deriving job ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            JobKind::Upload => "up",
            JobKind::Download => "down",
            JobKind::Delete => "del",
            JobKind::Restore => "rst",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Upload => write!(f, "upload"),
            JobKind::Download => write!(f, "download"),
            JobKind::Delete => write!(f, "delete"),
            JobKind::Restore => write!(f, "restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
    Remote,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Upload, Direction::Download, Direction::Remote];
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
            Direction::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Verifying,
    Finished,
    Failed,
    Stopped,
    Duplicated,
}

impl JobStatus {
    /// Occupies a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Verifying)
    }

    /// No worker will touch the job again unless it is retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped | JobStatus::Duplicated
        )
    }

    /// Terminal and never coming back to the queue
    pub fn is_done(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Duplicated)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Verifying => write!(f, "verifying"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Duplicated => write!(f, "duplicated"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "verifying" => Ok(JobStatus::Verifying),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            "duplicated" => Ok(JobStatus::Duplicated),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// Failure classification carried by failed jobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Network,
    Timeout,
    Auth,
    NotFound,
    Conflict,
    Integrity,
    LocalIo,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Worth retrying in place without user action
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "notFound",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Integrity => "integrity",
            ErrorKind::LocalIo => "localIo",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    Replace,
    #[default]
    Skip,
}

/// Whether a retried download keeps its bytes on disk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ResumePolicy {
    Restart,
    #[default]
    ByteRange,
}

fn default_verify() -> bool {
    true
}

/// User supplied per-job options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default)]
    pub overwrite: OverwritePolicy,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub part_size: Option<u64>,
    #[serde(default)]
    pub resume: ResumePolicy,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            overwrite: OverwritePolicy::default(),
            storage_class: None,
            part_size: None,
            resume: ResumePolicy::default(),
            verify: true,
        }
    }
}

/// Full observable state of one job. Carried whole, never as a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub kind: JobKind,
    pub direction: Direction,
    pub status: JobStatus,
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
    pub rate_bytes_per_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
    pub retry_count: u32,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub region: String,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub local_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Standby,
    Running,
    Finished,
    Errored,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Standby => write!(f, "standby"),
            BatchStatus::Running => write!(f, "running"),
            BatchStatus::Finished => write!(f, "finished"),
            BatchStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Aggregated view of one user action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub finished: usize,
    pub errored: usize,
    pub stopped: usize,
}
