//! Events the owning process pushes to every attached surface

use serde::{Deserialize, Serialize};

use crate::types::{BatchProgress, Direction, JobSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDrained {
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobRemoved {
    pub job_id: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    JobUpdated(JobSnapshot),
    BatchProgress(BatchProgress),
    QueueDrained(QueueDrained),
    JobRemoved(JobRemoved),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::JobUpdated(_) => "jobUpdated",
            Event::BatchProgress(_) => "batchProgress",
            Event::QueueDrained(_) => "queueDrained",
            Event::JobRemoved(_) => "jobRemoved",
        }
    }
}
