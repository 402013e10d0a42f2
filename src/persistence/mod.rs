//! Queue file persistence
//!
//! [`QueueStore`] reads and writes the file. [`PersistenceHandle`] keeps it
//! current: status changes and removals are written right away, progress of
//! running jobs at most once per `persist_interval`.

mod store;

use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use transfer_protocol::Event;

use crate::error::{TransferError, TransferResult};
use crate::events::{EventBus, EventKind, Propagation, SubscriptionToken};
use crate::job::Job;
use crate::queue::QueueSet;

pub use store::{QueueStore, QUEUE_FILE_VERSION};

enum Signal {
    Changed { urgent: bool },
    Flush(oneshot::Sender<TransferResult<()>>),
}

pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<Signal>,
    task: JoinHandle<()>,
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionToken>,
}

impl PersistenceHandle {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<QueueStore>,
        queues: QueueSet,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let updates = tx.clone();
        let on_update = bus.subscribe(EventKind::JobUpdated, move |event| {
            if let Event::JobUpdated(snapshot) = event {
                // Progress ticks of active jobs can wait; anything else cannot.
                let urgent = !snapshot.status.is_active();
                let _ = updates.send(Signal::Changed { urgent });
            }
            Propagation::Continue
        });
        let removals = tx.clone();
        let on_remove = bus.subscribe(EventKind::JobRemoved, move |_| {
            let _ = removals.send(Signal::Changed { urgent: true });
            Propagation::Continue
        });

        let task = tokio::spawn(writer_loop(store, queues, rx, interval));
        Self {
            tx,
            task,
            bus,
            subscriptions: vec![on_update, on_remove],
        }
    }

    /// Write now and wait for the result
    pub async fn flush(&self) -> TransferResult<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Signal::Flush(reply))
            .map_err(|_| TransferError::Persistence("Queue writer has stopped".to_string()))?;
        done.await
            .map_err(|_| TransferError::Persistence("Queue writer has stopped".to_string()))?
    }

    /// Final write, then stop listening
    pub async fn shutdown(self) -> TransferResult<()> {
        for token in &self.subscriptions {
            self.bus.unsubscribe(*token);
        }
        let result = self.flush().await;
        drop(self.tx);
        let _ = self.task.await;
        result
    }
}

fn all_jobs(queues: &QueueSet) -> Vec<Job> {
    queues.all().into_iter().flat_map(|q| q.jobs()).collect()
}

async fn write(store: &Arc<QueueStore>, queues: &QueueSet) -> TransferResult<()> {
    let jobs = all_jobs(queues);
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save(&jobs).map(|_| ()))
        .await
        .map_err(|e| TransferError::Persistence(format!("Queue writer panicked: {}", e)))?
}

async fn writer_loop(
    store: Arc<QueueStore>,
    queues: QueueSet,
    mut rx: mpsc::UnboundedReceiver<Signal>,
    interval: Duration,
) {
    let mut dirty = false;
    let mut last_write: Option<Instant> = None;

    loop {
        let signal = if dirty {
            let due = last_write.map_or_else(Instant::now, |at| at + interval);
            tokio::select! {
                signal = rx.recv() => signal,
                _ = tokio::time::sleep_until(due) => {
                    if let Err(e) = write(&store, &queues).await {
                        error!("queue_persist_failed: error={}", e);
                    }
                    dirty = false;
                    last_write = Some(Instant::now());
                    continue;
                }
            }
        } else {
            rx.recv().await
        };
        let Some(first) = signal else {
            if dirty {
                if let Err(e) = write(&store, &queues).await {
                    error!("queue_persist_failed: error={}", e);
                }
            }
            break;
        };

        // Fold everything already queued into one write
        let mut urgent = false;
        let mut waiters = Vec::new();
        let mut closed = false;
        let mut pending = Some(first);
        while let Some(signal) = pending.take() {
            match signal {
                Signal::Changed { urgent: now } => {
                    dirty = true;
                    urgent |= now;
                }
                Signal::Flush(reply) => waiters.push(reply),
            }
            match rx.try_recv() {
                Ok(next) => pending = Some(next),
                Err(TryRecvError::Disconnected) => closed = true,
                Err(TryRecvError::Empty) => {}
            }
        }

        let due = last_write.map_or(true, |at| at.elapsed() >= interval);
        if !waiters.is_empty() || (dirty && (urgent || due || closed)) {
            let result = write(&store, &queues).await;
            dirty = false;
            last_write = Some(Instant::now());
            if let Err(e) = &result {
                error!("queue_persist_failed: error={}", e);
            }
            for reply in waiters {
                let _ = reply.send(
                    result
                        .as_ref()
                        .map(|_| ())
                        .map_err(|e| TransferError::Persistence(e.to_string())),
                );
            }
        }
        if closed {
            break;
        }
    }
    debug!("queue_writer_stopped: {}", store.path().display());
}
