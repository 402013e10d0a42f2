//! Command/event channel between UI surfaces and the queues
//!
//! Commands come in as [`CommandEnvelope`]s and are answered synchronously
//! with a [`CommandReply`]. Everything that happens afterwards reaches the
//! surfaces as [`Event`]s. A surface attaching late should send `listJobs`
//! to catch up; the queues are the source of truth.

mod expand;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use transfer_protocol::{
    Command, CommandEnvelope, CommandReply, Event, JobSnapshot, ListFilter, StopTarget,
};

use crate::error::{TransferError, TransferResult};
use crate::events::{EventBus, Propagation};
use crate::job::Job;
use crate::progress::ProgressAggregator;
use crate::queue::{Enqueued, QueueSet};

/// Receiving end handed to one UI surface
pub type SurfaceReceiver = mpsc::UnboundedReceiver<Event>;

pub struct ChannelHost {
    queues: QueueSet,
    aggregator: Arc<ProgressAggregator>,
    surfaces: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl ChannelHost {
    pub fn new(queues: QueueSet, aggregator: Arc<ProgressAggregator>, bus: &EventBus) -> Self {
        let surfaces: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let fan_out = surfaces.clone();
        bus.subscribe_all(move |event| {
            let mut surfaces = fan_out.lock();
            let before = surfaces.len();
            surfaces.retain(|tx| tx.send(event.clone()).is_ok());
            if surfaces.len() != before {
                debug!("surface_detached: remaining={}", surfaces.len());
            }
            Propagation::Continue
        });
        Self {
            queues,
            aggregator,
            surfaces,
        }
    }

    /// Open a new event stream for a UI surface
    pub fn attach_surface(&self) -> SurfaceReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut surfaces = self.surfaces.lock();
        surfaces.push(tx);
        info!("surface_attached: total={}", surfaces.len());
        rx
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.lock().len()
    }

    /// Parse and run a JSON command
    pub async fn dispatch_json(&self, text: &str) -> CommandReply {
        match CommandEnvelope::from_json(text) {
            Ok(envelope) => self.dispatch(&envelope).await,
            Err(e) => {
                warn!("command_rejected: error={}", e);
                CommandReply::rejected(e.to_string())
            }
        }
    }

    pub async fn dispatch(&self, envelope: &CommandEnvelope) -> CommandReply {
        match envelope.decode() {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                warn!("command_rejected: action={} error={}", envelope.action, e);
                CommandReply::rejected(e.to_string())
            }
        }
    }

    /// Run a decoded command. Failures come back as `Rejected`, never as a
    /// panic or an error crossing the channel.
    pub async fn handle(&self, command: Command) -> CommandReply {
        let action = command.action();
        debug!("command_received: {}", action);
        let result = match command {
            Command::SubmitUpload(submit) => {
                let jobs = expand::expand_upload(&submit).await;
                self.submit(jobs)
            }
            Command::SubmitDownload(submit) => self.submit(expand::expand_download(&submit)),
            Command::SubmitDelete(submit) => self.submit(Ok(expand::expand_delete(&submit))),
            Command::SubmitRestore(submit) => self.submit(Ok(expand::expand_restore(&submit))),
            Command::Stop(target) => self.stop(&target),
            Command::Retry(job) => self.retry(&job.job_id),
            Command::RetryFailed(filter) => Ok(self.each_queue(|q| {
                q.retry_failed(filter.batch_id.as_deref())
            })),
            Command::ResumeAll(_) => Ok(self.each_queue(|q| q.resume_all())),
            Command::RemoveFinished(_) => Ok(self.each_queue(|q| q.remove_finished())),
            Command::Remove(job) => self.remove(&job.job_id),
            Command::ListJobs(filter) => Ok(CommandReply::Jobs {
                jobs: self.list(&filter),
            }),
            Command::SignOut(_) => Ok(self.sign_out()),
        };
        result.unwrap_or_else(|e| {
            warn!("command_failed: {} error={}", action, e);
            CommandReply::rejected(e.to_string())
        })
    }

    fn each_queue(&self, f: impl Fn(&crate::queue::JobQueue) -> usize) -> CommandReply {
        let count = self.queues.all().into_iter().map(|q| f(q)).sum();
        CommandReply::Affected { count }
    }

    fn submit(&self, jobs: TransferResult<Vec<Job>>) -> TransferResult<CommandReply> {
        let jobs = jobs?;
        if jobs.is_empty() {
            return Err(TransferError::InvalidRequest(
                "Nothing to transfer".to_string(),
            ));
        }
        let batch_id = uuid::Uuid::new_v4().to_string();
        let jobs: Vec<Job> = jobs
            .into_iter()
            .map(|job| job.with_batch(batch_id.clone()))
            .collect();

        // A finished job with the same id is replaced by the new request.
        for job in &jobs {
            let queue = self.queues.get(job.direction());
            if let Some(existing) = queue.get(&job.id) {
                if existing.status.is_done() {
                    queue.remove(&job.id)?;
                }
            }
        }

        self.aggregator
            .track(&batch_id, jobs.iter().map(|j| j.id.clone()));

        let mut job_ids = Vec::with_capacity(jobs.len());
        let mut added = 0;
        let mut existing_batch = None;
        for job in jobs {
            let queue = self.queues.get(job.direction());
            match queue.enqueue(job)? {
                Enqueued::Added(snapshot) => {
                    added += 1;
                    job_ids.push(snapshot.id);
                }
                // Still counted by the batch it already belongs to
                Enqueued::Existing(snapshot) => {
                    if existing_batch.is_none() {
                        existing_batch = snapshot.batch_id;
                    }
                    job_ids.push(snapshot.id);
                }
            }
        }
        // Nothing new: point the caller at the batch that reports these jobs
        let batch_id = match existing_batch {
            Some(existing) if added == 0 => existing,
            _ => batch_id,
        };
        info!(
            "batch_submitted: {} jobs={} added={}",
            batch_id,
            job_ids.len(),
            added
        );
        Ok(CommandReply::Submitted { batch_id, job_ids })
    }

    fn stop(&self, target: &StopTarget) -> TransferResult<CommandReply> {
        match (&target.job_id, &target.batch_id) {
            (Some(job_id), None) => {
                let queue = self
                    .queues
                    .find(job_id)
                    .ok_or_else(|| TransferError::JobNotFound(job_id.clone()))?;
                queue.stop(job_id)?;
                Ok(CommandReply::Affected { count: 1 })
            }
            (None, Some(batch_id)) => Ok(self.each_queue(|q| q.stop_batch(batch_id))),
            _ => Err(TransferError::InvalidRequest(
                "stop needs exactly one of jobId or batchId".to_string(),
            )),
        }
    }

    fn retry(&self, job_id: &str) -> TransferResult<CommandReply> {
        let queue = self
            .queues
            .find(job_id)
            .ok_or_else(|| TransferError::JobNotFound(job_id.to_string()))?;
        queue.retry(job_id)?;
        Ok(CommandReply::Affected { count: 1 })
    }

    fn remove(&self, job_id: &str) -> TransferResult<CommandReply> {
        let queue = self
            .queues
            .find(job_id)
            .ok_or_else(|| TransferError::JobNotFound(job_id.to_string()))?;
        queue.remove(job_id)?;
        Ok(CommandReply::Affected { count: 1 })
    }

    fn list(&self, filter: &ListFilter) -> Vec<JobSnapshot> {
        self.queues
            .all()
            .into_iter()
            .filter(|q| filter.direction.map_or(true, |d| d == q.direction()))
            .flat_map(|q| match filter.batch_id.as_deref() {
                Some(batch_id) => q.snapshots_for_batch(batch_id),
                None => q.snapshots(),
            })
            .collect()
    }

    /// User switch: cancel and forget everything
    fn sign_out(&self) -> CommandReply {
        let count = self.queues.all().into_iter().map(|q| q.clear()).sum();
        self.aggregator.reset();
        info!("sign_out: cleared={}", count);
        CommandReply::Affected { count }
    }
}
