//! Wire contract between the process that owns transfer queues and the UI
//! surfaces that drive and observe them.
//!
//! Commands travel as `{version, action, payload}`, events as
//! `{type, payload}`. Both are closed tagged enums so either side can be
//! built and tested against this crate alone, without a live IPC transport.

pub mod command;
pub mod event;
pub mod types;

pub use command::{
    BatchFilter, Command, CommandEnvelope, CommandReply, JobRef, ListFilter, NoPayload,
    RemoteItem, RemoteLocation, StopTarget, SubmitDelete, SubmitDownload, SubmitRestore,
    SubmitUpload,
};
pub use event::{Event, JobRemoved, QueueDrained};
pub use types::{
    BatchProgress, BatchStatus, Direction, ErrorKind, JobErrorInfo, JobKind, JobOptions,
    JobSnapshot, JobStatus, OverwritePolicy, ResumePolicy,
};

/// Bumped whenever a command or event changes shape
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
