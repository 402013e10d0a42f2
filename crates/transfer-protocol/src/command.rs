//! Commands a UI surface sends to the process owning the queues

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Direction, JobOptions, JobSnapshot};
use crate::{ProtocolError, PROTOCOL_VERSION};

/// Bucket plus key prefix on the remote side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLocation {
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

/// One remote object picked in the browser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Path relative to the download folder. Defaults to the key's file name.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitUpload {
    pub paths: Vec<String>,
    pub destination: RemoteLocation,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDownload {
    pub region: String,
    pub bucket: String,
    pub items: Vec<RemoteItem>,
    pub destination: String,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDelete {
    pub region: String,
    pub bucket: String,
    pub items: Vec<RemoteItem>,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRestore {
    pub region: String,
    pub bucket: String,
    pub items: Vec<RemoteItem>,
    pub days: u32,
    #[serde(default)]
    pub options: JobOptions,
}

/// Exactly one of the two ids must be set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopTarget {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchFilter {
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NoPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum Command {
    SubmitUpload(SubmitUpload),
    SubmitDownload(SubmitDownload),
    SubmitDelete(SubmitDelete),
    SubmitRestore(SubmitRestore),
    Stop(StopTarget),
    Retry(JobRef),
    RetryFailed(BatchFilter),
    ResumeAll(NoPayload),
    RemoveFinished(NoPayload),
    Remove(JobRef),
    ListJobs(ListFilter),
    SignOut(NoPayload),
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::SubmitUpload(_) => "submitUpload",
            Command::SubmitDownload(_) => "submitDownload",
            Command::SubmitDelete(_) => "submitDelete",
            Command::SubmitRestore(_) => "submitRestore",
            Command::Stop(_) => "stop",
            Command::Retry(_) => "retry",
            Command::RetryFailed(_) => "retryFailed",
            Command::ResumeAll(_) => "resumeAll",
            Command::RemoveFinished(_) => "removeFinished",
            Command::Remove(_) => "remove",
            Command::ListJobs(_) => "listJobs",
            Command::SignOut(_) => "signOut",
        }
    }

    /// Wrap into the current envelope version
    pub fn into_envelope(self) -> Result<CommandEnvelope, ProtocolError> {
        let action = self.action().to_string();
        let mut value = serde_json::to_value(&self)?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(CommandEnvelope {
            version: PROTOCOL_VERSION,
            action,
            payload,
        })
    }
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Raw `{version, action, payload}` as it crosses the process boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    #[serde(default = "default_version")]
    pub version: u32,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl CommandEnvelope {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            action: action.into(),
            payload,
        }
    }

    /// Parse an envelope from its JSON text
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Validate the version and decode the typed command
    pub fn decode(&self) -> Result<Command, ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        if !KNOWN_ACTIONS.contains(&self.action.as_str()) {
            return Err(ProtocolError::UnknownAction(self.action.clone()));
        }
        let payload = match &self.payload {
            Value::Null => json!({}),
            other => other.clone(),
        };
        serde_json::from_value(json!({ "action": self.action, "payload": payload })).map_err(|e| {
            ProtocolError::InvalidPayload {
                action: self.action.clone(),
                reason: e.to_string(),
            }
        })
    }
}

const KNOWN_ACTIONS: [&str; 12] = [
    "submitUpload",
    "submitDownload",
    "submitDelete",
    "submitRestore",
    "stop",
    "retry",
    "retryFailed",
    "resumeAll",
    "removeFinished",
    "remove",
    "listJobs",
    "signOut",
];

/// Synchronous answer to a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum CommandReply {
    #[serde(rename_all = "camelCase")]
    Submitted {
        batch_id: String,
        job_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Affected { count: usize },
    #[serde(rename_all = "camelCase")]
    Jobs { jobs: Vec<JobSnapshot> },
    #[serde(rename_all = "camelCase")]
    Rejected { reason: String },
}

impl CommandReply {
    pub fn rejected(reason: impl Into<String>) -> Self {
        CommandReply::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandReply::Rejected { .. })
    }
}
