//! Owns the queues, pools, aggregator and queue file for one signed-in user

use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transfer_protocol::Direction;

use crate::channel::ChannelHost;
use crate::config::TransferSettings;
use crate::error::{TransferError, TransferResult};
use crate::events::EventBus;
use crate::persistence::{PersistenceHandle, QueueStore};
use crate::progress::ProgressAggregator;
use crate::queue::QueueSet;
use crate::storage::StorageClient;
use crate::worker::{PoolHandle, TransferWorkerPool};

pub struct TransferService {
    bus: Arc<EventBus>,
    queues: QueueSet,
    aggregator: Arc<ProgressAggregator>,
    host: ChannelHost,
    pools: Vec<PoolHandle>,
    persistence: PersistenceHandle,
    retention: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TransferService {
    /// Wire everything up, put back what the queue file remembers and start
    /// the worker pools. Must be called inside a tokio runtime.
    pub async fn start(
        settings: TransferSettings,
        storage: Arc<dyn StorageClient>,
        queue_file: impl Into<PathBuf>,
    ) -> TransferResult<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let bus = Arc::new(EventBus::new());
        let queues = QueueSet::new(&settings, bus.clone());
        let aggregator = Arc::new(ProgressAggregator::new(bus.clone()));
        // Surfaces get each job update ahead of the batch progress it causes
        let host = ChannelHost::new(queues.clone(), aggregator.clone(), &bus);
        aggregator.subscribe();

        let store = Arc::new(QueueStore::open(queue_file, &settings));
        let rehydrate_store = store.clone();
        let rehydrate_queues = queues.clone();
        let restored = tokio::task::spawn_blocking(move || {
            rehydrate_store.rehydrate(&rehydrate_queues)
        })
        .await
        .map_err(|e| TransferError::Persistence(format!("Rehydrate task failed: {}", e)))??;

        let persistence = PersistenceHandle::spawn(
            store,
            queues.clone(),
            bus.clone(),
            settings.persist_interval(),
        );

        let pools = Direction::ALL
            .iter()
            .map(|direction| {
                TransferWorkerPool::spawn(
                    queues.get(*direction).clone(),
                    storage.clone(),
                    settings.clone(),
                )
            })
            .collect();

        let retention = settings
            .retention()
            .map(|age| spawn_retention(queues.clone(), age));

        info!("transfer_service_started: restored={}", restored);
        Ok(Self {
            bus,
            queues,
            aggregator,
            host,
            pools,
            persistence,
            retention,
        })
    }

    pub fn host(&self) -> &ChannelHost {
        &self.host
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.aggregator
    }

    /// Force the queue file up to date
    pub async fn flush(&self) -> TransferResult<()> {
        self.persistence.flush().await
    }

    /// Interrupt running jobs, wait for every worker and write the queue
    /// file one last time. Waiting jobs resume on the next start.
    pub async fn shutdown(self) -> TransferResult<()> {
        if let Some((stop, task)) = self.retention {
            stop.cancel();
            let _ = task.await;
        }
        for pool in self.pools {
            pool.shutdown().await;
        }
        let result = self.persistence.shutdown().await;
        if let Err(e) = &result {
            warn!("transfer_service_final_write_failed: error={}", e);
        }
        info!("transfer_service_stopped");
        result
    }
}

/// Periodically drop completed jobs older than `age`
fn spawn_retention(
    queues: QueueSet,
    age: std::time::Duration,
) -> (CancellationToken, JoinHandle<()>) {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let period = (age / 4).clamp(
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(3_600),
    );
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed: usize = queues
                        .all()
                        .into_iter()
                        .map(|q| q.remove_finished_older_than(age))
                        .sum();
                    if removed > 0 {
                        info!("retention_sweep: removed={}", removed);
                    }
                }
            }
        }
    });
    (stop, task)
}
