//! Batch and queue summaries derived from job snapshots

mod aggregator;
mod rate;

pub use aggregator::{JobProgress, ProgressAggregator, QueueSummary};
pub use rate::RateEstimator;
