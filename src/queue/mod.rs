//! Per-direction job queue with a fixed concurrency bound
//!
//! Insertion order is priority (FIFO). Every mutation goes through one
//! mutex, and the resulting snapshot is published on the [`EventBus`] before
//! the lock is released, so observers see a job's updates in order.

mod set;
mod types;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use transfer_protocol::{Direction, Event, JobRemoved, JobSnapshot, JobStatus, QueueDrained};

use crate::error::{TransferError, TransferResult};
use crate::events::EventBus;
use crate::job::Job;

pub use set::QueueSet;
pub use types::{ActiveJob, Enqueued};

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    /// One token per occupied worker slot. A slot is held until the worker
    /// releases it, even if the job was removed meanwhile.
    slots: HashMap<String, CancellationToken>,
    drained_announced: bool,
}

impl QueueState {
    fn position(&self, id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    fn job_mut(&mut self, id: &str) -> TransferResult<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| TransferError::JobNotFound(id.to_string()))
    }
}

pub struct JobQueue {
    direction: Direction,
    concurrency: usize,
    state: Mutex<QueueState>,
    bus: Arc<EventBus>,
    wakeup: Notify,
}

impl JobQueue {
    pub fn new(direction: Direction, concurrency: usize, bus: Arc<EventBus>) -> Self {
        Self {
            direction,
            concurrency: concurrency.max(1),
            state: Mutex::new(QueueState {
                drained_announced: true,
                ..QueueState::default()
            }),
            bus,
            wakeup: Notify::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn publish_job(&self, job: &Job) {
        self.bus.publish(&Event::JobUpdated(job.snapshot()));
    }

    fn publish_removed(&self, id: &str) {
        self.bus.publish(&Event::JobRemoved(JobRemoved {
            job_id: id.to_string(),
            direction: self.direction,
        }));
    }

    fn check_direction(&self, job: &Job) -> TransferResult<()> {
        if job.direction() != self.direction {
            return Err(TransferError::InvalidRequest(format!(
                "{} job {} does not belong on the {} queue",
                job.kind, job.id, self.direction
            )));
        }
        Ok(())
    }

    /// Wait until a job is added or a slot frees up
    pub async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }

    fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Append a new Waiting job. An id already present returns the queued
    /// job unchanged instead of adding a duplicate.
    pub fn enqueue(&self, job: Job) -> TransferResult<Enqueued> {
        self.check_direction(&job)?;
        if job.status != JobStatus::Waiting {
            return Err(TransferError::InvalidRequest(format!(
                "Job {} must be waiting to be enqueued, found {}",
                job.id, job.status
            )));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(existing) = state.jobs.iter().find(|j| j.id == job.id) {
            debug!("queue_enqueue_existing: {} job={}", self.direction, job.id);
            return Ok(Enqueued::Existing(existing.snapshot()));
        }
        info!(
            "queue_enqueue: {} job={} key={} batch={:?}",
            self.direction, job.id, job.target.key, job.batch_id
        );
        let snapshot = job.snapshot();
        self.publish_job(&job);
        state.jobs.push(job);
        state.drained_announced = false;
        drop(guard);
        self.wake();
        Ok(Enqueued::Added(snapshot))
    }

    /// Put back a job loaded from the queue file, status untouched
    pub fn restore(&self, job: Job) -> TransferResult<Enqueued> {
        self.check_direction(&job)?;
        if job.status.is_active() {
            return Err(TransferError::InvalidRequest(format!(
                "Job {} cannot be restored while {}",
                job.id, job.status
            )));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(existing) = state.jobs.iter().find(|j| j.id == job.id) {
            return Ok(Enqueued::Existing(existing.snapshot()));
        }
        let snapshot = job.snapshot();
        let waiting = job.status == JobStatus::Waiting;
        self.publish_job(&job);
        state.jobs.push(job);
        if waiting {
            state.drained_announced = false;
        }
        drop(guard);
        if waiting {
            self.wake();
        }
        Ok(Enqueued::Added(snapshot))
    }

    /// Earliest-inserted Waiting job, now Running, or None when every slot
    /// is taken or nothing waits.
    pub fn next(&self) -> Option<ActiveJob> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.slots.len() >= self.concurrency {
            debug!(
                "queue_check: {} no slots active={}",
                self.direction,
                state.slots.len()
            );
            return None;
        }
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.status == JobStatus::Waiting)?;
        if let Err(e) = job.transition(JobStatus::Running) {
            warn!("queue_pick_failed: {} error={}", self.direction, e);
            return None;
        }
        let cancel = CancellationToken::new();
        state.slots.insert(job.id.clone(), cancel.clone());
        info!(
            "queue_pick: {} job={} active={} slots={}",
            self.direction,
            job.id,
            state.slots.len(),
            self.concurrency
        );
        self.publish_job(job);
        Some(ActiveJob {
            job: job.clone(),
            cancel,
        })
    }

    /// Running -> Verifying
    pub fn start_verifying(&self, id: &str) -> TransferResult<JobSnapshot> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.transition(JobStatus::Verifying)?;
        info!("job_status: {} -> verifying", id);
        let snapshot = job.snapshot();
        self.publish_job(job);
        Ok(snapshot)
    }

    /// Fold a worker's progress report into the job. Publishes only when the
    /// bytes or the total moved.
    pub fn update_progress(
        &self,
        id: &str,
        transferred: u64,
        total: Option<u64>,
        rate: f64,
    ) -> TransferResult<bool> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        if !job.is_active() {
            return Ok(false);
        }
        let changed = job.record_progress(transferred, total);
        job.rate_bytes_per_sec = rate;
        if changed {
            self.publish_job(job);
        }
        Ok(changed)
    }

    /// In-place retry bookkeeping, visible to observers
    pub fn record_retry(&self, id: &str, retry_count: u32) -> TransferResult<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.retry_count = retry_count;
        info!("job_retry: {} attempt={}", id, retry_count);
        self.publish_job(job);
        Ok(())
    }

    /// Verifying -> Running after a failed integrity check. Counts as a retry.
    pub fn retransfer(&self, id: &str, retry_count: u32) -> TransferResult<JobSnapshot> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.transition(JobStatus::Running)?;
        job.retry_count = retry_count;
        info!("job_status: {} -> running (retransfer, attempt={})", id, retry_count);
        let snapshot = job.snapshot();
        self.publish_job(job);
        Ok(snapshot)
    }

    pub fn finish(&self, id: &str) -> TransferResult<JobSnapshot> {
        self.complete(id, |job| job.transition(JobStatus::Finished))
    }

    pub fn fail(&self, id: &str, error: &TransferError) -> TransferResult<JobSnapshot> {
        let info = error.to_info();
        self.complete(id, move |job| job.fail(info))
    }

    pub fn mark_duplicated(&self, id: &str) -> TransferResult<JobSnapshot> {
        self.complete(id, |job| job.transition(JobStatus::Duplicated))
    }

    /// Worker saw its cancellation token fire
    pub fn finish_stopped(&self, id: &str) -> TransferResult<JobSnapshot> {
        self.complete(id, |job| job.transition(JobStatus::Stopped))
    }

    /// Terminal transition by the worker. The slot is released even when the
    /// job vanished or the transition is refused.
    fn complete(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Job) -> TransferResult<()>,
    ) -> TransferResult<JobSnapshot> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.slots.remove(id);
        let result = match state.job_mut(id) {
            Ok(job) => match apply(job) {
                Ok(()) => {
                    match &job.error {
                        Some(err) => warn!("job_status: {} -> {} error={}", id, job.status, err.message),
                        None => info!("job_status: {} -> {}", id, job.status),
                    }
                    self.publish_job(job);
                    Ok(job.snapshot())
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.announce_if_drained(state);
        drop(guard);
        self.wake();
        result
    }

    fn announce_if_drained(&self, state: &mut QueueState) {
        if state.drained_announced || !state.slots.is_empty() {
            return;
        }
        if state.jobs.iter().any(|j| j.status == JobStatus::Waiting) {
            return;
        }
        state.drained_announced = true;
        info!("queue_drained: {}", self.direction);
        self.bus.publish(&Event::QueueDrained(QueueDrained {
            direction: self.direction,
        }));
    }

    /// Waiting jobs stop at once. Active jobs get their token cancelled and
    /// turn Stopped when the worker acknowledges. Terminal jobs are left as is.
    pub fn stop(&self, id: &str) -> TransferResult<JobSnapshot> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let snapshot = Self::stop_locked(self, state, id)?;
        self.announce_if_drained(state);
        Ok(snapshot)
    }

    fn stop_locked(&self, state: &mut QueueState, id: &str) -> TransferResult<JobSnapshot> {
        let token = state.slots.get(id).cloned();
        let job = state.job_mut(id)?;
        match job.status {
            JobStatus::Waiting => {
                job.transition(JobStatus::Stopped)?;
                info!("job_status: {} -> stopped (never started)", id);
                self.publish_job(job);
            }
            JobStatus::Running | JobStatus::Verifying => {
                if let Some(token) = token {
                    info!("stop_job: flagged active job {}", id);
                    token.cancel();
                }
            }
            _ => debug!("stop_job: {} already {}", id, job.status),
        }
        Ok(job.snapshot())
    }

    fn stop_where(&self, mut matches: impl FnMut(&Job) -> bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids: Vec<String> = state
            .jobs
            .iter()
            .filter(|j| !j.is_terminal() && matches(j))
            .map(|j| j.id.clone())
            .collect();
        for id in &ids {
            let _ = self.stop_locked(state, id);
        }
        self.announce_if_drained(state);
        ids.len()
    }

    pub fn stop_all(&self) -> usize {
        let stopped = self.stop_where(|_| true);
        info!("stop_all: {} stopped={}", self.direction, stopped);
        stopped
    }

    pub fn stop_batch(&self, batch_id: &str) -> usize {
        let stopped = self.stop_where(|j| j.batch_id.as_deref() == Some(batch_id));
        info!(
            "stop_batch: {} batch={} stopped={}",
            self.direction, batch_id, stopped
        );
        stopped
    }

    /// Shutdown: fire every slot token, leave Waiting jobs alone
    pub fn interrupt_active(&self) -> usize {
        let state = self.state.lock();
        for token in state.slots.values() {
            token.cancel();
        }
        if !state.slots.is_empty() {
            info!(
                "queue_interrupt: {} active={}",
                self.direction,
                state.slots.len()
            );
        }
        state.slots.len()
    }

    /// Failed/Stopped -> Waiting, re-entering at the tail
    pub fn retry(&self, id: &str) -> TransferResult<JobSnapshot> {
        let mut guard = self.state.lock();
        let snapshot = self.retry_locked(&mut guard, id)?;
        drop(guard);
        self.wake();
        Ok(snapshot)
    }

    fn retry_locked(&self, state: &mut QueueState, id: &str) -> TransferResult<JobSnapshot> {
        let index = state
            .position(id)
            .ok_or_else(|| TransferError::JobNotFound(id.to_string()))?;
        if state.slots.contains_key(id) {
            return Err(TransferError::InvalidRequest(format!(
                "Job {} is still winding down",
                id
            )));
        }
        state.jobs[index].reset_for_retry()?;
        let job = state.jobs.remove(index);
        info!(
            "job_status: {} -> waiting (retry, offset={})",
            id,
            job.resume_offset()
        );
        self.publish_job(&job);
        let snapshot = job.snapshot();
        state.jobs.push(job);
        state.drained_announced = false;
        Ok(snapshot)
    }

    fn retry_where(&self, matches: impl Fn(&Job) -> bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids: Vec<String> = state
            .jobs
            .iter()
            .filter(|j| matches(j))
            .map(|j| j.id.clone())
            .collect();
        let mut retried = 0;
        for id in &ids {
            match self.retry_locked(state, id) {
                Ok(_) => retried += 1,
                Err(e) => debug!("retry_skip: {} error={}", id, e),
            }
        }
        drop(guard);
        if retried > 0 {
            self.wake();
        }
        retried
    }

    /// Bulk "retry failed", optionally limited to one batch
    pub fn retry_failed(&self, batch_id: Option<&str>) -> usize {
        let retried = self.retry_where(|j| {
            j.status == JobStatus::Failed
                && batch_id.map_or(true, |b| j.batch_id.as_deref() == Some(b))
        });
        info!("retry_failed: {} retried={}", self.direction, retried);
        retried
    }

    /// Resume every Stopped job
    pub fn resume_all(&self) -> usize {
        let resumed = self.retry_where(|j| j.status == JobStatus::Stopped);
        info!("resume_all: {} resumed={}", self.direction, resumed);
        resumed
    }

    /// Drop a job. An active job is cancelled first; its slot stays taken
    /// until the worker lets go.
    pub fn remove(&self, id: &str) -> TransferResult<JobSnapshot> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let index = state
            .position(id)
            .ok_or_else(|| TransferError::JobNotFound(id.to_string()))?;
        if let Some(token) = state.slots.get(id) {
            token.cancel();
        }
        let job = state.jobs.remove(index);
        info!("remove_job: {} {}", self.direction, id);
        self.publish_removed(id);
        self.announce_if_drained(state);
        Ok(job.snapshot())
    }

    fn remove_where(&self, matches: impl Fn(&Job) -> bool) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut removed = Vec::new();
        state.jobs.retain(|j| {
            if matches(j) {
                removed.push(j.id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.publish_removed(id);
        }
        removed.len()
    }

    /// "Clear completed": drop Finished and Duplicated jobs
    pub fn remove_finished(&self) -> usize {
        let removed = self.remove_where(|j| j.status.is_done());
        info!("remove_finished: {} removed={}", self.direction, removed);
        removed
    }

    /// Retention: drop completed jobs not updated within `age`
    pub fn remove_finished_older_than(&self, age: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.remove_where(|j| j.status.is_done() && j.updated_at <= cutoff);
        if removed > 0 {
            info!(
                "remove_finished_older_than: {} removed={}",
                self.direction, removed
            );
        }
        removed
    }

    /// Sign-out / user switch: cancel everything and forget every job
    pub fn clear(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for token in state.slots.values() {
            token.cancel();
        }
        let removed: Vec<String> = state.jobs.drain(..).map(|j| j.id).collect();
        for id in &removed {
            self.publish_removed(id);
        }
        state.drained_announced = true;
        info!("queue_cleared: {} removed={}", self.direction, removed.len());
        removed.len()
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.state.lock().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.state
            .lock()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .map(Job::snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().position(id).is_some()
    }

    /// Every job in queue order
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.state.lock().jobs.iter().map(Job::snapshot).collect()
    }

    pub fn snapshots_for_batch(&self, batch_id: &str) -> Vec<JobSnapshot> {
        self.state
            .lock()
            .jobs
            .iter()
            .filter(|j| j.batch_id.as_deref() == Some(batch_id))
            .map(Job::snapshot)
            .collect()
    }

    /// Full job records, for the queue file
    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.state
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .count()
    }

    /// Nothing waiting and no slot in use
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.slots.is_empty() && !state.jobs.iter().any(|j| j.status == JobStatus::Waiting)
    }
}
