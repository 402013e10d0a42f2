//! Worker pool draining one [`JobQueue`]
//!
//! A dispatcher task sleeps on the queue's wakeup, pulls every job
//! [`JobQueue::next`] hands out and spawns one task per job. The queue's slot
//! accounting is the only thing bounding concurrency; workers never talk to
//! each other.

mod execute;
mod throttle;

use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::TransferSettings;
use crate::queue::JobQueue;
use crate::storage::StorageClient;
use execute::{run_job, WorkerContext};

pub use throttle::ProgressThrottle;

pub struct TransferWorkerPool;

impl TransferWorkerPool {
    /// Start draining `queue`. Must be called inside a tokio runtime.
    pub fn spawn(
        queue: Arc<JobQueue>,
        storage: Arc<dyn StorageClient>,
        settings: Arc<TransferSettings>,
    ) -> PoolHandle {
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            storage,
            settings,
        });
        let shutdown = CancellationToken::new();
        let workers = TaskTracker::new();

        let dispatcher = tokio::spawn(dispatch_loop(ctx, shutdown.clone(), workers.clone()));
        info!(
            "worker_pool_started: {} slots={}",
            queue.direction(),
            queue.concurrency()
        );

        PoolHandle {
            queue,
            shutdown,
            workers,
            dispatcher,
        }
    }
}

async fn dispatch_loop(
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
    workers: TaskTracker,
) {
    loop {
        while let Some(active) = ctx.queue.next() {
            workers.spawn(run_job(ctx.clone(), active));
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ctx.queue.wait_for_work() => {}
        }
    }
}

pub struct PoolHandle {
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    dispatcher: JoinHandle<()>,
}

impl PoolHandle {
    /// Stop picking jobs, interrupt the running ones and wait until every
    /// worker has recorded its outcome. Waiting jobs stay Waiting.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.dispatcher.await;
        let interrupted = self.queue.interrupt_active();
        self.workers.close();
        self.workers.wait().await;
        info!(
            "worker_pool_stopped: {} interrupted={}",
            self.queue.direction(),
            interrupted
        );
    }
}
