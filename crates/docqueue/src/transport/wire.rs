//! Server-shaped payloads for the pull, push and command endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{derive_file_name, detect_mime_type, JobConfiguration, JobId, JobRecord, JobState};

/// A job object as returned by the full-pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJob {
    pub id: JobId,
    pub source_file: String,
    pub status: JobState,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub attempt: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Server-side event time of the last change; the LWW clock.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteJob {
    /// Converts the server payload into an authoritative record.
    pub fn into_record(self) -> JobRecord {
        let last_event_at = self.updated_at.unwrap_or(self.created_at);
        let error_detail = if self.status == JobState::Failed {
            self.error_message
        } else {
            None
        };
        // completed_at is set exactly for terminal states
        let completed_at = if self.status.is_terminal() {
            self.completed_at.or(Some(last_event_at))
        } else {
            None
        };
        JobRecord {
            file_name: derive_file_name(&self.source_file),
            mime_type: detect_mime_type(&self.source_file),
            id: self.id,
            status: self.status,
            progress: self.progress.unwrap_or(0.0).clamp(0.0, 1.0),
            attempt: self.attempt.unwrap_or(0),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at,
            error_detail,
            is_local_optimistic: false,
            configuration: JobConfiguration {
                provider: self.provider.unwrap_or_default(),
                prompt_id: self.prompt_id.unwrap_or_default(),
            },
            last_event_at,
            source_file: self.source_file,
        }
    }
}

/// An incremental update delivered over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDelta {
    pub id: JobId,
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Server-side event time; arrival time is used when absent.
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

/// Parses a push payload: either a batch array or a single delta object.
pub fn parse_push_payload(data: &str) -> Result<Vec<JobDelta>, serde_json::Error> {
    match serde_json::from_str::<Vec<JobDelta>>(data) {
        Ok(batch) => Ok(batch),
        Err(_) => serde_json::from_str::<JobDelta>(data).map(|delta| vec![delta]),
    }
}

/// User-triggered command types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Submit,
    Retry,
    Pause,
    Resume,
    Cancel,
    Delete,
    UpdateConfiguration,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Submit => write!(f, "submit"),
            CommandKind::Retry => write!(f, "retry"),
            CommandKind::Pause => write!(f, "pause"),
            CommandKind::Resume => write!(f, "resume"),
            CommandKind::Cancel => write!(f, "cancel"),
            CommandKind::Delete => write!(f, "delete"),
            CommandKind::UpdateConfiguration => write!(f, "update_configuration"),
        }
    }
}

/// Payload of a submit command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitPayload {
    pub source_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub provider: String,
    pub prompt_id: String,
}

/// Envelope accepted by the command endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandRequest {
    /// Builds a submit request for a new analysis job.
    pub fn submit(record: &JobRecord) -> Self {
        let payload = SubmitPayload {
            source_file: record.source_file.clone(),
            mime_type: record.mime_type.clone(),
            provider: record.configuration.provider.clone(),
            prompt_id: record.configuration.prompt_id.clone(),
        };
        Self {
            kind: CommandKind::Submit,
            job_id: None,
            // SubmitPayload serialization cannot fail; fall back to null
            payload: serde_json::to_value(&payload).ok(),
        }
    }

    /// Builds a request acting on an existing job.
    pub fn for_job(kind: CommandKind, id: JobId) -> Self {
        Self {
            kind,
            job_id: Some(id),
            payload: None,
        }
    }

    /// Builds an update-configuration request.
    pub fn update_configuration(id: JobId, patch: &crate::model::ConfigurationPatch) -> Self {
        Self {
            kind: CommandKind::UpdateConfiguration,
            job_id: Some(id),
            payload: serde_json::to_value(patch).ok(),
        }
    }
}

/// Acknowledgement returned by the command endpoint.
/// Carries the durable id for submits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    #[serde(default)]
    pub id: Option<JobId>,
}

/// Outcome of a delivered command: accepted, or explicitly refused by the
/// server. Network failure is a separate [`TransportError`](super::error::TransportError).
#[derive(Debug, Clone)]
pub enum CommandReply {
    Ack(CommandAck),
    Rejected { reason: String },
}

/// Error payload shape returned on explicit command rejection.
#[derive(Debug, Clone, Deserialize)]
pub struct RejectionBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RejectionBody {
    /// Extracts a human-readable reason, whichever field the server used.
    pub fn reason(self) -> Option<String> {
        self.error.or(self.message)
    }
}
