#![allow(dead_code)]

use async_trait::async_trait;
use bucket_transfer::protocol::{Event, JobSnapshot};
use bucket_transfer::{
    EventBus, EventKind, Job, JobTarget, ObjectMeta, ProgressSink, Propagation, StorageClient,
    TransferError, TransferOutcome, TransferResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the next call for a key should do instead of succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Network,
    NotFound,
    Auth,
    Conflict,
    /// Accept the call, then never report progress
    Stall,
    /// Put succeeds but the stored object comes out one byte too long
    Corrupt,
}

impl Scripted {
    fn into_error(self, key: &str) -> TransferError {
        match self {
            Scripted::Network => TransferError::Network(format!("connection reset on {}", key)),
            Scripted::NotFound => TransferError::NotFound(key.to_string()),
            Scripted::Auth => TransferError::Auth("signature expired".to_string()),
            Scripted::Conflict | Scripted::Stall | Scripted::Corrupt => {
                TransferError::Conflict(key.to_string())
            }
        }
    }
}

/// In-memory storage client with per-key failure scripts
pub struct ScriptedStorage {
    object_size: u64,
    chunks: u64,
    chunk_delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    head_scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    objects: Mutex<HashMap<String, ObjectMeta>>,
    started: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedStorage {
    pub fn new(object_size: u64, chunks: u64, chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            object_size,
            chunks: chunks.max(1),
            chunk_delay,
            scripts: Mutex::new(HashMap::new()),
            head_scripts: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, key: &str, steps: &[Scripted]) {
        self.scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(steps.iter().copied());
    }

    /// Fail upcoming `head` calls for `key`, one step per call
    pub fn script_head(&self, key: &str, steps: &[Scripted]) {
        self.head_scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(steps.iter().copied());
    }

    pub fn put_object(&self, key: &str, size: u64) {
        self.objects.lock().insert(
            key.to_string(),
            ObjectMeta {
                size,
                checksum: None,
            },
        );
    }

    pub fn has_object(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_corrupt(&self, key: &str) -> bool {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(key) {
            Some(steps) if steps.front() == Some(&Scripted::Corrupt) => {
                steps.pop_front();
                true
            }
            _ => false,
        }
    }

    fn begin(&self, key: &str) -> (InFlight<'_>, Option<Scripted>) {
        self.started.lock().push(key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let step = self
            .scripts
            .lock()
            .get_mut(key)
            .and_then(|steps| steps.pop_front());
        (InFlight(&self.in_flight), step)
    }

    async fn stream(
        &self,
        key: &str,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> TransferResult<TransferOutcome> {
        let (_guard, step) = self.begin(key);
        match step {
            Some(Scripted::Stall) => {
                cancel.cancelled().await;
                return Err(TransferError::Cancelled);
            }
            Some(other) => return Err(other.into_error(key)),
            None => {}
        }
        let chunk = self.object_size / self.chunks;
        for i in 1..=self.chunks {
            tokio::time::sleep(self.chunk_delay).await;
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let sent = if i == self.chunks {
                self.object_size
            } else {
                chunk * i
            };
            progress.report(sent, Some(self.object_size));
        }
        Ok(TransferOutcome {
            bytes: self.object_size,
            checksum: None,
        })
    }

    async fn remote_op(&self, key: &str) -> TransferResult<()> {
        let (_guard, step) = self.begin(key);
        tokio::time::sleep(self.chunk_delay).await;
        match step {
            Some(Scripted::Stall) => std::future::pending().await,
            Some(step) => Err(step.into_error(key)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageClient for ScriptedStorage {
    async fn head(&self, target: &JobTarget) -> TransferResult<Option<ObjectMeta>> {
        let step = self
            .head_scripts
            .lock()
            .get_mut(&target.key)
            .and_then(|steps| steps.pop_front());
        if let Some(step) = step {
            return Err(step.into_error(&target.key));
        }
        Ok(self.objects.lock().get(&target.key).cloned())
    }

    async fn put(
        &self,
        job: &Job,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome> {
        let corrupt = self.take_corrupt(&job.target.key);
        let outcome = self.stream(&job.target.key, &progress, &cancel).await?;
        let stored = if corrupt { outcome.bytes + 1 } else { outcome.bytes };
        self.put_object(&job.target.key, stored);
        Ok(outcome)
    }

    async fn get(
        &self,
        job: &Job,
        _offset: u64,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TransferResult<TransferOutcome> {
        self.stream(&job.target.key, &progress, &cancel).await
    }

    async fn delete(&self, job: &Job) -> TransferResult<()> {
        self.remote_op(&job.target.key).await?;
        self.objects.lock().remove(&job.target.key);
        Ok(())
    }

    async fn restore(&self, job: &Job, _days: u32) -> TransferResult<()> {
        self.remote_op(&job.target.key).await
    }

    async fn abort(&self, job_id: &str) -> TransferResult<()> {
        self.aborted.lock().push(job_id.to_string());
        Ok(())
    }
}

/// Every event published on `bus`, in order
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_all(move |event| {
        sink.lock().push(event.clone());
        Propagation::Continue
    });
    seen
}

/// Job snapshots for one job id, in publication order
pub fn record_job(bus: &EventBus, job_id: &str) -> Arc<Mutex<Vec<JobSnapshot>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let id = job_id.to_string();
    bus.subscribe(EventKind::JobUpdated, move |event| {
        if let Event::JobUpdated(snapshot) = event {
            if snapshot.id == id {
                sink.lock().push(snapshot.clone());
            }
        }
        Propagation::Continue
    });
    seen
}

/// Poll `check` until it holds, panicking after a generous deadline
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
