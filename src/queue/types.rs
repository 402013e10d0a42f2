use tokio_util::sync::CancellationToken;
use transfer_protocol::JobSnapshot;

use crate::job::Job;

/// Result of [`JobQueue::enqueue`](super::JobQueue::enqueue)
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Added(JobSnapshot),
    /// Same id was already queued; nothing was added
    Existing(JobSnapshot),
}

impl Enqueued {
    pub fn snapshot(&self) -> &JobSnapshot {
        match self {
            Enqueued::Added(snapshot) | Enqueued::Existing(snapshot) => snapshot,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Enqueued::Added(_))
    }
}

/// A job handed to a worker together with its cancellation token
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job: Job,
    pub cancel: CancellationToken,
}
