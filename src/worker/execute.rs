//! One job, start to finish, on one worker task

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use transfer_protocol::{JobKind, OverwritePolicy, ResumePolicy};

use super::throttle::ProgressThrottle;
use crate::config::TransferSettings;
use crate::error::{TransferError, TransferResult};
use crate::job::Job;
use crate::progress::RateEstimator;
use crate::queue::{ActiveJob, JobQueue};
use crate::storage::{checksum_file, ObjectMeta, ProgressSink, StorageClient, TransferOutcome};

/// How an execution ended
#[derive(Debug)]
pub(crate) enum Outcome {
    Finished,
    Duplicated,
    Stopped,
    Failed(TransferError),
}

/// Shared by every worker of one pool
pub(crate) struct WorkerContext {
    pub queue: Arc<JobQueue>,
    pub storage: Arc<dyn StorageClient>,
    pub settings: Arc<TransferSettings>,
}

/// Run `active` and record its terminal state, releasing the slot
pub(crate) async fn run_job(ctx: Arc<WorkerContext>, active: ActiveJob) {
    let ActiveJob { job, cancel } = active;
    let id = job.id.clone();
    let outcome = execute(&ctx, job, &cancel).await;
    settle(&ctx, &id, outcome).await;
}

async fn settle(ctx: &WorkerContext, id: &str, outcome: Outcome) {
    let result = match outcome {
        Outcome::Finished => ctx.queue.finish(id),
        Outcome::Duplicated => ctx.queue.mark_duplicated(id),
        Outcome::Stopped => {
            if let Err(e) = ctx.storage.abort(id).await {
                warn!("storage_abort_failed: {} error={}", id, e);
            }
            ctx.queue.finish_stopped(id)
        }
        Outcome::Failed(err) => ctx.queue.fail(id, &err),
    };
    if let Err(e) = result {
        // Usually the job was removed while running; the slot is free anyway.
        debug!("worker_settle_skipped: {} error={}", id, e);
    }
}

async fn execute(ctx: &WorkerContext, job: Job, cancel: &CancellationToken) -> Outcome {
    match run_with_retries(ctx, &job, cancel).await {
        Ok(outcome) => outcome,
        Err(TransferError::Cancelled) => Outcome::Stopped,
        Err(TransferError::Conflict(msg)) => {
            info!("job_duplicated: {} reason={}", job.id, msg);
            Outcome::Duplicated
        }
        Err(e) => Outcome::Failed(e),
    }
}

fn needs_verification(job: &Job) -> bool {
    job.options.verify && matches!(job.kind, JobKind::Upload | JobKind::Download)
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = TransferResult<T>>,
) -> TransferResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = fut => res,
    }
}

/// True when the destination already holds the same content and the job
/// says to leave it alone
async fn precheck(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
) -> TransferResult<bool> {
    if job.options.overwrite != OverwritePolicy::Skip {
        return Ok(false);
    }
    let Some(local) = job.target.local_path.as_deref() else {
        return Ok(false);
    };
    match job.kind {
        JobKind::Upload => {
            let Some(remote) = until_cancelled(cancel, ctx.storage.head(&job.target)).await?
            else {
                return Ok(false);
            };
            same_content(local, &remote).await
        }
        JobKind::Download => {
            // A partial file from an earlier attempt is not a finished copy.
            if job.transferred_bytes > 0 || !is_file(local).await {
                return Ok(false);
            }
            match until_cancelled(cancel, ctx.storage.head(&job.target)).await? {
                Some(remote) => same_content(local, &remote).await,
                None => Ok(false),
            }
        }
        JobKind::Delete | JobKind::Restore => Ok(false),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map_or(false, |meta| meta.is_file())
}

/// Sizes match and, when the remote exposes a checksum, so do the hashes
async fn same_content(local: &Path, remote: &ObjectMeta) -> TransferResult<bool> {
    let local_len = match tokio::fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Ok(false),
    };
    if local_len != remote.size {
        debug!(
            "precheck_size_differs: {} local={} remote={}",
            local.display(),
            local_len,
            remote.size
        );
        return Ok(false);
    }
    match remote.checksum.as_deref() {
        Some(expected) => Ok(checksum_file(local).await?.eq_ignore_ascii_case(expected)),
        None => Ok(true),
    }
}

/// Check the destination, move the data, then check the data. Transient
/// failures of any step are retried in place with backoff, resuming at the
/// step that failed. A failed integrity check sends the data once more
/// before the job fails.
async fn run_with_retries(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
) -> TransferResult<Outcome> {
    let cap = ctx.settings.retry_cap;
    let verify = needs_verification(job);
    let mut attempt = job.retry_count;
    let mut checked = false;
    let mut resent = false;
    let mut fresh = false;
    let mut delivered: Option<TransferOutcome> = None;

    loop {
        let failure = if !checked {
            match precheck(ctx, job, cancel).await {
                Ok(true) => {
                    info!("job_duplicated: {} key={}", job.id, job.target.key);
                    return Ok(Outcome::Duplicated);
                }
                Ok(false) => {
                    checked = true;
                    continue;
                }
                Err(e) => e,
            }
        } else if let Some(outcome) = &delivered {
            match until_cancelled(cancel, check_integrity(ctx, job, outcome)).await {
                Ok(()) => return Ok(Outcome::Finished),
                Err(e) => e,
            }
        } else {
            match attempt_once(ctx, job, fresh, cancel).await {
                Ok(outcome) if verify => {
                    ctx.queue.start_verifying(&job.id)?;
                    delivered = Some(outcome);
                    continue;
                }
                Ok(_) => return Ok(Outcome::Finished),
                Err(e) => e,
            }
        };

        match failure {
            TransferError::Integrity(reason) if !resent => {
                resent = true;
                attempt += 1;
                warn!(
                    "job_integrity_retry: {} attempt={} reason={}",
                    job.id, attempt, reason
                );
                ctx.queue.retransfer(&job.id, attempt)?;
                delivered = None;
                fresh = true;
            }
            e if e.is_transient() && attempt < cap => {
                attempt += 1;
                let delay = ctx.settings.backoff_delay(attempt);
                warn!(
                    "job_attempt_failed: {} attempt={} retry_in={}ms error={}",
                    job.id,
                    attempt,
                    delay.as_millis(),
                    e
                );
                ctx.queue.record_retry(&job.id, attempt)?;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            e => return Err(e),
        }
    }
}

/// Offset the next download attempt starts at. `fresh` discards whatever
/// is already on disk.
fn resume_offset(ctx: &WorkerContext, job: &Job, fresh: bool) -> u64 {
    if fresh
        || job.kind != JobKind::Download
        || job.options.resume != ResumePolicy::ByteRange
        || !ctx.storage.supports_range()
    {
        return 0;
    }
    ctx.queue
        .get(&job.id)
        .map(|current| current.transferred_bytes)
        .unwrap_or(job.transferred_bytes)
}

/// Progress bookkeeping shared with the storage client's callback
struct AttemptProgress {
    last_activity: Instant,
    throttle: ProgressThrottle,
    rate: RateEstimator,
    latest: (u64, Option<u64>),
}

async fn attempt_once(
    ctx: &WorkerContext,
    job: &Job,
    fresh: bool,
    cancel: &CancellationToken,
) -> TransferResult<TransferOutcome> {
    let offset = resume_offset(ctx, job, fresh);
    let state = Arc::new(Mutex::new(AttemptProgress {
        last_activity: Instant::now(),
        throttle: ProgressThrottle::new(
            ctx.settings.progress_interval(),
            ctx.settings.progress_chunk_bytes,
        ),
        rate: RateEstimator::default(),
        latest: (offset, job.total_bytes),
    }));

    let sink = {
        let state = state.clone();
        let queue = ctx.queue.clone();
        let id = job.id.clone();
        ProgressSink::new(move |transferred, total| {
            let now = Instant::now();
            let mut progress = state.lock();
            progress.last_activity = now;
            progress.latest = (transferred, total.or(progress.latest.1));
            let rate = progress.rate.sample(now.into_std(), transferred);
            if progress.throttle.should_emit(now, transferred) {
                drop(progress);
                if let Err(e) = queue.update_progress(&id, transferred, total, rate) {
                    debug!("progress_dropped: {} error={}", id, e);
                }
            }
        })
    };

    // Cancelled on timeout so the client stops at its next chunk
    let attempt_cancel = cancel.child_token();
    let call = run_storage_call(ctx, job, offset, sink, attempt_cancel.clone());
    tokio::pin!(call);

    let idle = ctx.settings.idle_timeout();
    let result = loop {
        let deadline = state.lock().last_activity + idle;
        tokio::select! {
            res = &mut call => break res,
            _ = cancel.cancelled() => break Err(TransferError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                let stalled_since = state.lock().last_activity;
                if Instant::now() >= stalled_since + idle {
                    attempt_cancel.cancel();
                    break Err(TransferError::Timeout(format!(
                        "no progress for {}s",
                        idle.as_secs_f64()
                    )));
                }
            }
        }
    };

    let outcome = result?;
    // Always land the final count, whatever the throttle held back.
    let (_, total) = state.lock().latest;
    let final_total = total.or(Some(outcome.bytes));
    ctx.queue
        .update_progress(&job.id, outcome.bytes, final_total, 0.0)?;
    Ok(outcome)
}

async fn run_storage_call(
    ctx: &WorkerContext,
    job: &Job,
    offset: u64,
    sink: ProgressSink,
    cancel: CancellationToken,
) -> TransferResult<TransferOutcome> {
    match job.kind {
        JobKind::Upload => ctx.storage.put(job, sink, cancel).await,
        JobKind::Download => ctx.storage.get(job, offset, sink, cancel).await,
        JobKind::Delete => {
            ctx.storage.delete(job).await?;
            Ok(TransferOutcome {
                bytes: 0,
                checksum: None,
            })
        }
        JobKind::Restore => {
            ctx.storage.restore(job, job.restore_days.unwrap_or(1)).await?;
            Ok(TransferOutcome {
                bytes: 0,
                checksum: None,
            })
        }
    }
}

/// Size check, then sha256 when both sides can produce one
async fn check_integrity(
    ctx: &WorkerContext,
    job: &Job,
    outcome: &TransferOutcome,
) -> TransferResult<()> {
    let remote = ctx.storage.head(&job.target).await?.ok_or_else(|| {
        TransferError::Integrity(format!(
            "{}/{} missing after transfer",
            job.target.bucket, job.target.key
        ))
    })?;
    let local_path = job.target.local_path.as_deref().ok_or_else(|| {
        TransferError::InvalidRequest(format!("Job {} has no local path", job.id))
    })?;
    let local_len = tokio::fs::metadata(local_path).await?.len();
    if remote.size != local_len {
        error!(
            "verify_size_mismatch: {} local={} remote={}",
            job.id, local_len, remote.size
        );
        return Err(TransferError::Integrity(format!(
            "size mismatch: local {} bytes, remote {} bytes",
            local_len, remote.size
        )));
    }

    if let Some(expected) = remote.checksum.as_deref() {
        let actual = match &outcome.checksum {
            Some(sum) => sum.clone(),
            None => checksum_file(local_path).await?,
        };
        if !actual.eq_ignore_ascii_case(expected) {
            error!(
                "verify_checksum_mismatch: {} local={} remote={}",
                job.id, actual, expected
            );
            return Err(TransferError::Integrity(format!(
                "checksum mismatch: local {}, remote {}",
                actual, expected
            )));
        }
    }
    debug!("verify_ok: {} bytes={}", job.id, local_len);
    Ok(())
}
