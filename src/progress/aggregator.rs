use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use transfer_protocol::{
    BatchProgress, BatchStatus, Direction, Event, JobRemoved, JobSnapshot, JobStatus,
};

use crate::events::{EventBus, EventKind, Propagation};

/// Which counter a job status lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Waiting,
    Active,
    Finished,
    Errored,
    Stopped,
}

impl From<JobStatus> for Bucket {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Waiting => Bucket::Waiting,
            JobStatus::Running | JobStatus::Verifying => Bucket::Active,
            JobStatus::Finished | JobStatus::Duplicated => Bucket::Finished,
            JobStatus::Failed => Bucket::Errored,
            JobStatus::Stopped => Bucket::Stopped,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    waiting: usize,
    active: usize,
    finished: usize,
    errored: usize,
    stopped: usize,
}

impl Counters {
    fn slot(&mut self, bucket: Bucket) -> &mut usize {
        match bucket {
            Bucket::Waiting => &mut self.waiting,
            Bucket::Active => &mut self.active,
            Bucket::Finished => &mut self.finished,
            Bucket::Errored => &mut self.errored,
            Bucket::Stopped => &mut self.stopped,
        }
    }

    fn add(&mut self, bucket: Bucket) {
        *self.slot(bucket) += 1;
    }

    fn remove(&mut self, bucket: Bucket) {
        let slot = self.slot(bucket);
        *slot = slot.saturating_sub(1);
    }

    fn total(&self) -> usize {
        self.waiting + self.active + self.finished + self.errored + self.stopped
    }
}

#[derive(Debug, Default)]
struct BatchState {
    counters: Counters,
    /// Last status seen per member job
    members: HashMap<String, JobStatus>,
    started: bool,
    last_emitted: Option<BatchProgress>,
}

impl BatchState {
    fn progress(&self, batch_id: &str) -> BatchProgress {
        let c = &self.counters;
        let total = c.total();
        let terminal = c.finished + c.errored + c.stopped;
        let status = if total > 0 && terminal == total {
            if c.errored > 0 {
                BatchStatus::Errored
            } else {
                BatchStatus::Finished
            }
        } else if self.started {
            BatchStatus::Running
        } else {
            BatchStatus::Standby
        };
        BatchProgress {
            batch_id: batch_id.to_string(),
            status,
            total,
            finished: c.finished,
            errored: c.errored,
            stopped: c.stopped,
        }
    }

    /// Move one member to `status`; false when nothing changed
    fn apply(&mut self, job_id: &str, status: JobStatus) -> bool {
        let previous = self.members.insert(job_id.to_string(), status);
        if previous == Some(status) {
            return false;
        }
        if let Some(previous) = previous {
            self.counters.remove(previous.into());
        }
        self.counters.add(status.into());
        if status != JobStatus::Waiting {
            self.started = true;
        }
        true
    }

    fn forget(&mut self, job_id: &str) -> bool {
        match self.members.remove(job_id) {
            Some(previous) => {
                self.counters.remove(previous.into());
                true
            }
            None => false,
        }
    }
}

/// Latest byte-level view of one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub id: String,
    pub direction: Direction,
    pub status: JobStatus,
    pub transferred: u64,
    pub total: Option<u64>,
    pub rate_bytes_per_sec: f64,
}

/// Per-direction roll-up of every job the aggregator has seen
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSummary {
    pub waiting: usize,
    pub active: usize,
    pub finished: usize,
    pub errored: usize,
    pub stopped: usize,
    pub transferred_bytes: u64,
    /// Sum of known totals only
    pub total_bytes: u64,
    pub rate_bytes_per_sec: f64,
}

#[derive(Default)]
struct DirectionState {
    counters: Counters,
    transferred: u64,
    total: u64,
    rate: f64,
}

impl DirectionState {
    fn summary(&self) -> QueueSummary {
        QueueSummary {
            waiting: self.counters.waiting,
            active: self.counters.active,
            finished: self.counters.finished,
            errored: self.counters.errored,
            stopped: self.counters.stopped,
            transferred_bytes: self.transferred,
            total_bytes: self.total,
            rate_bytes_per_sec: self.rate.max(0.0),
        }
    }

    fn add(&mut self, job: &JobProgress) {
        self.counters.add(job.status.into());
        self.transferred += job.transferred;
        self.total += job.total.unwrap_or(0);
        if job.status.is_active() {
            self.rate += job.rate_bytes_per_sec;
        }
    }

    fn remove(&mut self, job: &JobProgress) {
        self.counters.remove(job.status.into());
        self.transferred = self.transferred.saturating_sub(job.transferred);
        self.total = self.total.saturating_sub(job.total.unwrap_or(0));
        if job.status.is_active() {
            self.rate -= job.rate_bytes_per_sec;
        }
    }
}

#[derive(Default)]
struct AggregatorState {
    batches: HashMap<String, BatchState>,
    job_batch: HashMap<String, String>,
    jobs: HashMap<String, JobProgress>,
    directions: HashMap<Direction, DirectionState>,
}

/// Folds job snapshots into batch and queue summaries
///
/// Every update touches only the counters of the job that changed, so a
/// batch of thousands of files costs the same per event as a batch of one.
/// Replaying a snapshot that was already applied is a no-op.
pub struct ProgressAggregator {
    state: Mutex<AggregatorState>,
    bus: Arc<EventBus>,
}

impl ProgressAggregator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            bus,
        }
    }

    /// Create an aggregator already listening to job updates and removals
    pub fn attach(bus: Arc<EventBus>) -> Arc<Self> {
        let aggregator = Arc::new(Self::new(bus));
        aggregator.subscribe();
        aggregator
    }

    /// Start folding job updates and removals from the bus. Handlers run in
    /// registration order, so whoever subscribes first sees a job update
    /// before the batch progress it causes.
    pub fn subscribe(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(EventKind::JobUpdated, move |event| {
            if let (Some(aggregator), Event::JobUpdated(snapshot)) = (weak.upgrade(), event) {
                aggregator.apply(snapshot);
            }
            Propagation::Continue
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(EventKind::JobRemoved, move |event| {
            if let (Some(aggregator), Event::JobRemoved(JobRemoved { job_id, .. })) =
                (weak.upgrade(), event)
            {
                aggregator.forget_job(job_id);
            }
            Propagation::Continue
        });
    }

    /// Register a batch and its members before any of them reports
    pub fn track<I, S>(&self, batch_id: &str, job_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        let mut added = 0;
        for job_id in job_ids {
            let job_id = job_id.into();
            if state.job_batch.contains_key(&job_id) {
                continue;
            }
            let batch = state.batches.entry(batch_id.to_string()).or_default();
            batch.apply(&job_id, JobStatus::Waiting);
            state.job_batch.insert(job_id, batch_id.to_string());
            added += 1;
        }
        debug!("batch_track: {} added={}", batch_id, added);
        self.emit_if_changed(&mut state, batch_id);
    }

    /// Fold one snapshot in. Returns whether any summary moved.
    pub fn apply(&self, snapshot: &JobSnapshot) -> bool {
        let mut state = self.state.lock();
        let mut changed = Self::apply_job(&mut state, snapshot);

        let Some(batch_id) = snapshot.batch_id.as_deref() else {
            return changed;
        };
        if !state.job_batch.contains_key(&snapshot.id) {
            state
                .job_batch
                .insert(snapshot.id.clone(), batch_id.to_string());
        }
        let batch = state.batches.entry(batch_id.to_string()).or_default();
        if batch.apply(&snapshot.id, snapshot.status) {
            changed = true;
            self.emit_if_changed(&mut state, batch_id);
        }
        changed
    }

    fn apply_job(state: &mut AggregatorState, snapshot: &JobSnapshot) -> bool {
        let next = JobProgress {
            id: snapshot.id.clone(),
            direction: snapshot.direction,
            status: snapshot.status,
            transferred: snapshot.transferred_bytes,
            total: snapshot.total_bytes,
            rate_bytes_per_sec: snapshot.rate_bytes_per_sec,
        };
        let previous = state.jobs.insert(snapshot.id.clone(), next.clone());
        if previous.as_ref() == Some(&next) {
            return false;
        }
        let lane = state.directions.entry(snapshot.direction).or_default();
        if let Some(previous) = &previous {
            lane.remove(previous);
        }
        lane.add(&next);
        true
    }

    /// Drop a removed job from every summary
    pub fn forget_job(&self, job_id: &str) {
        let mut state = self.state.lock();
        if let Some(progress) = state.jobs.remove(job_id) {
            if let Some(lane) = state.directions.get_mut(&progress.direction) {
                lane.remove(&progress);
            }
        }
        let Some(batch_id) = state.job_batch.remove(job_id) else {
            return;
        };
        let emptied = match state.batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.forget(job_id);
                batch.counters.total() == 0
            }
            None => return,
        };
        if emptied {
            state.batches.remove(&batch_id);
            info!("batch_forgotten: {}", batch_id);
        } else {
            self.emit_if_changed(&mut state, &batch_id);
        }
    }

    /// Sign-out: drop every summary
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = AggregatorState::default();
    }

    fn emit_if_changed(&self, state: &mut AggregatorState, batch_id: &str) {
        let Some(batch) = state.batches.get_mut(batch_id) else {
            return;
        };
        let progress = batch.progress(batch_id);
        if batch.last_emitted.as_ref() == Some(&progress) {
            return;
        }
        if batch.last_emitted.as_ref().map(|p| p.status) != Some(progress.status) {
            info!(
                "batch_status: {} -> {} total={} finished={} errored={} stopped={}",
                batch_id,
                progress.status,
                progress.total,
                progress.finished,
                progress.errored,
                progress.stopped
            );
        }
        batch.last_emitted = Some(progress.clone());
        self.bus.publish(&Event::BatchProgress(progress));
    }

    pub fn progress(&self, batch_id: &str) -> Option<BatchProgress> {
        self.state
            .lock()
            .batches
            .get(batch_id)
            .map(|b| b.progress(batch_id))
    }

    pub fn batches(&self) -> Vec<BatchProgress> {
        let state = self.state.lock();
        let mut batches: Vec<BatchProgress> = state
            .batches
            .iter()
            .map(|(id, b)| b.progress(id))
            .collect();
        batches.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        batches
    }

    pub fn job_progress(&self, job_id: &str) -> Option<JobProgress> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn queue_summary(&self, direction: Direction) -> QueueSummary {
        self.state
            .lock()
            .directions
            .get(&direction)
            .map(DirectionState::summary)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transfer_protocol::JobKind;

    fn snapshot(id: &str, batch: &str, status: JobStatus, transferred: u64) -> JobSnapshot {
        JobSnapshot {
            id: id.to_string(),
            kind: JobKind::Upload,
            direction: Direction::Upload,
            status,
            transferred_bytes: transferred,
            total_bytes: Some(100),
            rate_bytes_per_sec: 0.0,
            error: None,
            retry_count: 0,
            batch_id: Some(batch.to_string()),
            region: "auto".to_string(),
            bucket: "b".to_string(),
            key: id.to_string(),
            local_path: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn collecting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<BatchProgress>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventKind::BatchProgress, move |event| {
            if let Event::BatchProgress(p) = event {
                sink.lock().push(p.clone());
            }
            Propagation::Continue
        });
        (bus, seen)
    }

    #[test]
    fn batch_moves_from_standby_to_finished() {
        let (bus, seen) = collecting_bus();
        let aggregator = ProgressAggregator::attach(bus.clone());
        aggregator.track("b1", ["a", "b"]);
        assert_eq!(aggregator.progress("b1").unwrap().status, BatchStatus::Standby);

        aggregator.apply(&snapshot("a", "b1", JobStatus::Running, 0));
        assert_eq!(aggregator.progress("b1").unwrap().status, BatchStatus::Running);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Finished, 100));
        aggregator.apply(&snapshot("b", "b1", JobStatus::Running, 0));
        aggregator.apply(&snapshot("b", "b1", JobStatus::Duplicated, 0));

        let last = seen.lock().last().cloned().unwrap();
        assert_eq!(last.status, BatchStatus::Finished);
        assert_eq!((last.total, last.finished, last.errored), (2, 2, 0));
    }

    #[test]
    fn one_failure_marks_batch_errored_once_all_settle() {
        let aggregator = ProgressAggregator::new(Arc::new(EventBus::new()));
        aggregator.track("b1", ["a", "b"]);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Failed, 0));
        assert_eq!(aggregator.progress("b1").unwrap().status, BatchStatus::Running);
        aggregator.apply(&snapshot("b", "b1", JobStatus::Finished, 100));
        let progress = aggregator.progress("b1").unwrap();
        assert_eq!(progress.status, BatchStatus::Errored);
        assert_eq!(progress.errored, 1);
    }

    #[test]
    fn stopped_is_terminal_but_not_errored() {
        let aggregator = ProgressAggregator::new(Arc::new(EventBus::new()));
        aggregator.track("b1", ["a", "b"]);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Stopped, 0));
        aggregator.apply(&snapshot("b", "b1", JobStatus::Finished, 100));
        let progress = aggregator.progress("b1").unwrap();
        assert_eq!(progress.status, BatchStatus::Finished);
        assert_eq!((progress.stopped, progress.errored), (1, 0));
    }

    #[test]
    fn replayed_snapshots_change_nothing() {
        let (bus, seen) = collecting_bus();
        let aggregator = ProgressAggregator::attach(bus);
        aggregator.track("b1", ["a", "b"]);
        let running = snapshot("a", "b1", JobStatus::Running, 40);
        assert!(aggregator.apply(&running));
        let before = (aggregator.progress("b1"), seen.lock().len());

        assert!(!aggregator.apply(&running));
        assert!(!aggregator.apply(&running));
        assert_eq!((aggregator.progress("b1"), seen.lock().len()), before);
        assert_eq!(aggregator.queue_summary(Direction::Upload).transferred_bytes, 40);
    }

    #[test]
    fn untracked_job_joins_its_batch() {
        let aggregator = ProgressAggregator::new(Arc::new(EventBus::new()));
        aggregator.apply(&snapshot("late", "b9", JobStatus::Waiting, 0));
        assert_eq!(aggregator.progress("b9").unwrap().total, 1);
    }

    #[test]
    fn retry_moves_job_back_out_of_errored() {
        let aggregator = ProgressAggregator::new(Arc::new(EventBus::new()));
        aggregator.track("b1", ["a"]);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Failed, 0));
        assert_eq!(aggregator.progress("b1").unwrap().status, BatchStatus::Errored);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Waiting, 0));
        let progress = aggregator.progress("b1").unwrap();
        assert_eq!(progress.status, BatchStatus::Running);
        assert_eq!(progress.errored, 0);
    }

    #[test]
    fn removal_shrinks_batch_and_lane() {
        let bus = Arc::new(EventBus::new());
        let aggregator = ProgressAggregator::attach(bus.clone());
        aggregator.track("b1", ["a", "b"]);
        aggregator.apply(&snapshot("a", "b1", JobStatus::Finished, 100));

        bus.publish(&Event::JobRemoved(JobRemoved {
            job_id: "a".to_string(),
            direction: Direction::Upload,
        }));
        assert_eq!(aggregator.progress("b1").unwrap().total, 1);
        assert_eq!(aggregator.queue_summary(Direction::Upload).finished, 0);

        aggregator.forget_job("b");
        assert!(aggregator.progress("b1").is_none());
    }

    #[test]
    fn lane_summary_tracks_bytes_and_counts() {
        let aggregator = ProgressAggregator::new(Arc::new(EventBus::new()));
        aggregator.apply(&snapshot("a", "b1", JobStatus::Running, 10));
        aggregator.apply(&snapshot("a", "b1", JobStatus::Running, 60));
        aggregator.apply(&snapshot("b", "b1", JobStatus::Waiting, 0));
        let summary = aggregator.queue_summary(Direction::Upload);
        assert_eq!(summary.active, 1);
        assert_eq!(summary.waiting, 1);
        assert_eq!(summary.transferred_bytes, 60);
        assert_eq!(summary.total_bytes, 200);
        assert_eq!(
            aggregator.queue_summary(Direction::Download),
            QueueSummary::default()
        );
    }
}
