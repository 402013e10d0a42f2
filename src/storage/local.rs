//! Filesystem-backed bucket store: `<root>/<bucket>/<key>` is an object and
//! `<root>/.archive/<bucket>/<key>` is an archived one waiting for restore.

use async_trait::async_trait;
use log::{debug, info};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;

use super::checksum::{checksum_file, ChecksumWriter};
use super::{ObjectMeta, ProgressSink, StorageClient, TransferOutcome};
use crate::config::{TransferSettings, DEFAULT_CHUNK_SIZE};
use crate::error::{TransferError, TransferResult};
use crate::job::{Job, JobTarget};

const ARCHIVE_DIR: &str = ".archive";

#[derive(Debug, Clone)]
pub struct LocalBucketStore {
    root: PathBuf,
    chunk_size: usize,
    /// Artificial pause after every chunk, to make transfers observable
    chunk_delay: Option<Duration>,
}

impl LocalBucketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: None,
        }
    }

    /// Store whose copy chunk follows `settings.chunk_size`
    pub fn from_settings(root: impl Into<PathBuf>, settings: &TransferSettings) -> Self {
        Self::new(root).with_chunk_size(settings.chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a live object. Keys that climb out of the bucket are refused.
    pub fn object_path(&self, bucket: &str, key: &str) -> TransferResult<PathBuf> {
        Ok(self.root.join(checked_segment(bucket)?).join(checked_key(key)?))
    }

    pub fn archive_path(&self, bucket: &str, key: &str) -> TransferResult<PathBuf> {
        Ok(self
            .root
            .join(ARCHIVE_DIR)
            .join(checked_segment(bucket)?)
            .join(checked_key(key)?))
    }

    fn local_path<'a>(job: &'a Job) -> TransferResult<&'a Path> {
        job.target.local_path.as_deref().ok_or_else(|| {
            TransferError::InvalidRequest(format!("Job {} has no local path", job.id))
        })
    }

    /// Copy `reader` into `writer` chunk by chunk, checking `cancel` at every
    /// boundary. Returns the bytes copied by this call.
    #[allow(clippy::too_many_arguments)]
    async fn pump(
        &self,
        reader: &mut File,
        writer: &mut File,
        start: u64,
        total: u64,
        hasher: &mut Option<ChecksumWriter>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> TransferResult<u64> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        progress.report(start, Some(total));
        loop {
            if cancel.is_cancelled() {
                writer.flush().await?;
                return Err(TransferError::Cancelled);
            }
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..read]);
            }
            copied += read as u64;
            progress.report(start + copied, Some(total));
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
        }
        writer.flush().await?;
        Ok(copied)
    }
}

fn checked_segment(segment: &str) -> TransferResult<&str> {
    if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
        return Err(TransferError::InvalidRequest(format!(
            "Invalid bucket name: {:?}",
            segment
        )));
    }
    Ok(segment)
}

fn checked_key(key: &str) -> TransferResult<PathBuf> {
    let path = Path::new(key.trim_start_matches('/'));
    let clean = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if key.is_empty() || !clean {
        return Err(TransferError::InvalidRequest(format!(
            "Invalid object key: {:?}",
            key
        )));
    }
    Ok(path.to_path_buf())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[async_trait]
impl StorageClient for LocalBucketStore {
    async fn head(&self, target: &JobTarget) -> TransferResult<Option<ObjectMeta>> {
        let path = self.object_path(&target.bucket, &target.key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                size: meta.len(),
                checksum: Some(checksum_file(&path).await?),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        job: &Job,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome> {
        let source = Self::local_path(job)?;
        let destination = self.object_path(&job.target.bucket, &job.target.key)?;
        let total = fs::metadata(source).await?.len();
        let mut reader = File::open(source).await?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Objects appear atomically: stream into a part file, rename at the end.
        let staging = part_path(&destination);
        let mut writer = File::create(&staging).await?;
        let mut hasher = Some(ChecksumWriter::new());

        let result = self
            .pump(&mut reader, &mut writer, 0, total, &mut hasher, &progress, &cancel)
            .await;
        drop(writer);
        let copied = match result {
            Ok(copied) => copied,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e);
            }
        };
        fs::rename(&staging, &destination).await?;
        info!(
            "local_put_done: {} {}/{} bytes={}",
            job.id, job.target.bucket, job.target.key, copied
        );
        Ok(TransferOutcome {
            bytes: copied,
            checksum: hasher.map(ChecksumWriter::finish),
        })
    }

    async fn get(
        &self,
        job: &Job,
        offset: u64,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome> {
        let source = self.object_path(&job.target.bucket, &job.target.key)?;
        let destination = Self::local_path(job)?;
        let total = match fs::metadata(&source).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NotFound(format!(
                    "{}/{}",
                    job.target.bucket, job.target.key
                )))
            }
            Err(e) => return Err(e.into()),
        };

        // Resume only when the partial file really holds `offset` bytes
        let existing = match fs::metadata(destination).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let start = if offset > 0 && existing >= offset && offset <= total {
            offset
        } else {
            0
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut reader = File::open(&source).await?;
        let mut writer = if start > 0 {
            let mut f = OpenOptions::new().write(true).open(destination).await?;
            f.set_len(start).await?;
            f.seek(SeekFrom::End(0)).await?;
            reader.seek(SeekFrom::Start(start)).await?;
            debug!("local_get_resume: {} offset={}", job.id, start);
            f
        } else {
            File::create(destination).await?
        };
        // A resumed stream cannot hash the prefix it skipped
        let mut hasher = if start == 0 {
            Some(ChecksumWriter::new())
        } else {
            None
        };

        let copied = self
            .pump(&mut reader, &mut writer, start, total, &mut hasher, &progress, &cancel)
            .await?;
        info!(
            "local_get_done: {} {}/{} bytes={} resumed_from={}",
            job.id, job.target.bucket, job.target.key, copied, start
        );
        Ok(TransferOutcome {
            bytes: start + copied,
            checksum: hasher.map(ChecksumWriter::finish),
        })
    }

    async fn delete(&self, job: &Job) -> TransferResult<()> {
        let path = self.object_path(&job.target.bucket, &job.target.key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(
                    "local_delete_done: {} {}/{}",
                    job.id, job.target.bucket, job.target.key
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound(
                format!("{}/{}", job.target.bucket, job.target.key),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn restore(&self, job: &Job, days: u32) -> TransferResult<()> {
        let live = self.object_path(&job.target.bucket, &job.target.key)?;
        if fs::metadata(&live).await.is_ok() {
            debug!("local_restore_skip: {} already live", job.id);
            return Ok(());
        }
        let archived = self.archive_path(&job.target.bucket, &job.target.key)?;
        if fs::metadata(&archived).await.is_err() {
            return Err(TransferError::NotFound(format!(
                "{}/{}",
                job.target.bucket, job.target.key
            )));
        }
        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&archived, &live).await?;
        info!(
            "local_restore_done: {} {}/{} days={}",
            job.id, job.target.bucket, job.target.key, days
        );
        Ok(())
    }
}
