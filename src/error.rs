//! Error type shared by queues, workers, storage clients and persistence

use std::io;
use thiserror::Error;
use transfer_protocol::{ErrorKind, JobErrorInfo, JobStatus};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transfer stalled: {0}")]
    Timeout(String),

    #[error("Credentials rejected: {0}")]
    Auth(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Destination already exists: {0}")]
    Conflict(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Local IO error: {0}")]
    LocalIo(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Queue file error: {0}")]
    Persistence(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid settings: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] transfer_protocol::ProtocolError),
}

impl TransferError {
    /// Classification recorded on a failed job
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Network(_) => ErrorKind::Network,
            TransferError::Timeout(_) => ErrorKind::Timeout,
            TransferError::Auth(_) => ErrorKind::Auth,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::Conflict(_) => ErrorKind::Conflict,
            TransferError::Integrity(_) => ErrorKind::Integrity,
            TransferError::LocalIo(_) => ErrorKind::LocalIo,
            TransferError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn to_info(&self) -> JobErrorInfo {
        JobErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransferError::Timeout(err.to_string()),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransferError::Network(err.to_string()),
            _ => TransferError::LocalIo(err.to_string()),
        }
    }
}

impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
