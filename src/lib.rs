//! Transfer job engine for an object storage client
//!
//! Uploads, downloads, deletes and restores are expanded into [`job::Job`]s,
//! queued per direction with a fixed concurrency bound, executed by a worker
//! pool against a [`storage::StorageClient`], summarized per batch and
//! persisted so interrupted work survives a restart. UI surfaces drive it
//! through the [`channel::ChannelHost`] with the wire types of
//! `transfer_protocol`.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod lockfile;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod service;
pub mod storage;
pub mod worker;

pub use channel::{ChannelHost, SurfaceReceiver};
pub use config::TransferSettings;
pub use error::{TransferError, TransferResult};
pub use events::{EventBus, EventKind, Propagation, SubscriptionToken};
pub use job::{Job, JobTarget};
pub use persistence::{PersistenceHandle, QueueStore};
pub use progress::{ProgressAggregator, QueueSummary};
pub use queue::{ActiveJob, Enqueued, JobQueue, QueueSet};
pub use service::TransferService;
pub use storage::{LocalBucketStore, ObjectMeta, ProgressSink, StorageClient, TransferOutcome};
pub use worker::{PoolHandle, TransferWorkerPool};

pub use transfer_protocol as protocol;
