use std::sync::Arc;
use transfer_protocol::Direction;

use super::JobQueue;
use crate::config::TransferSettings;
use crate::events::EventBus;

/// The three direction queues, sharing one event bus
#[derive(Clone)]
pub struct QueueSet {
    pub upload: Arc<JobQueue>,
    pub download: Arc<JobQueue>,
    pub remote: Arc<JobQueue>,
}

impl QueueSet {
    pub fn new(settings: &TransferSettings, bus: Arc<EventBus>) -> Self {
        let make = |direction| {
            Arc::new(JobQueue::new(
                direction,
                settings.concurrency(direction),
                bus.clone(),
            ))
        };
        Self {
            upload: make(Direction::Upload),
            download: make(Direction::Download),
            remote: make(Direction::Remote),
        }
    }

    pub fn get(&self, direction: Direction) -> &Arc<JobQueue> {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
            Direction::Remote => &self.remote,
        }
    }

    pub fn all(&self) -> [&Arc<JobQueue>; 3] {
        [&self.upload, &self.download, &self.remote]
    }

    /// Queue currently holding `job_id`
    pub fn find(&self, job_id: &str) -> Option<&Arc<JobQueue>> {
        self.all().into_iter().find(|q| q.contains(job_id))
    }
}
