//! Storage client contract the workers call into
//!
//! The job subsystem never talks to the network itself. Anything that can
//! stat, put, get, delete and restore objects can back it: a signed S3
//! client in the desktop app, [`LocalBucketStore`] for demos and tests.

mod checksum;
mod local;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::TransferResult;
use crate::job::{Job, JobTarget};

pub use checksum::{checksum_file, ChecksumWriter};
pub use local::LocalBucketStore;

/// What the remote side knows about an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Hex sha256 of the content, when the backend exposes one
    pub checksum: Option<String>,
}

/// Result of one completed put or get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes now present at the destination, including resumed ones
    pub bytes: u64,
    pub checksum: Option<String>,
}

/// Progress callback handed to storage clients. Reports carry absolute byte
/// counts, never deltas.
#[derive(Clone)]
pub struct ProgressSink {
    report: Arc<dyn Fn(u64, Option<u64>) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(report: impl Fn(u64, Option<u64>) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn report(&self, transferred: u64, total: Option<u64>) {
        (self.report)(transferred, total)
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressSink")
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Metadata of a remote object, `None` when it does not exist
    async fn head(&self, target: &JobTarget) -> TransferResult<Option<ObjectMeta>>;

    /// Upload `job.target.local_path` to the job's bucket/key. Implementations
    /// check `cancel` between chunks and return `TransferError::Cancelled`.
    async fn put(
        &self,
        job: &Job,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome>;

    /// Download into `job.target.local_path`, starting at `offset` bytes
    async fn get(
        &self,
        job: &Job,
        offset: u64,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome>;

    async fn delete(&self, job: &Job) -> TransferResult<()>;

    async fn restore(&self, job: &Job, days: u32) -> TransferResult<()>;

    /// Release whatever a cancelled transfer left open (multipart uploads)
    async fn abort(&self, _job_id: &str) -> TransferResult<()> {
        Ok(())
    }

    /// Whether `get` honors a non-zero offset
    fn supports_range(&self) -> bool {
        true
    }
}
