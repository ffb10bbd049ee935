//! The canonical queue entry and its identifiers.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::JobState;

/// Identifier of a queue entry.
///
/// The server assigns numeric durable ids; until a submission is confirmed
/// the record carries a client-generated local id. Untagged on the wire:
/// numbers deserialize as durable, strings as local.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum JobId {
    Durable(i64),
    Local(String),
}

impl JobId {
    /// Mints a fresh local id for an optimistic record.
    pub fn new_local() -> Self {
        JobId::Local(format!("local-{}", uuid::Uuid::new_v4()))
    }

    /// Returns true for client-generated ids the server has not confirmed.
    pub fn is_local(&self) -> bool {
        matches!(self, JobId::Local(_))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobId::Durable(n) => write!(f, "{}", n),
            JobId::Local(s) => write!(f, "{}", s),
        }
    }
}

/// Analysis configuration of a job. Mutable only while the job is pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    /// AI provider to run the analysis with.
    pub provider: String,
    /// Identifier of the analysis prompt.
    pub prompt_id: String,
}

/// Partial update to a pending job's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

impl ConfigurationPatch {
    /// Applies the patch to a configuration, returning true if anything changed.
    pub fn apply_to(&self, configuration: &mut JobConfiguration) -> bool {
        let mut changed = false;
        if let Some(provider) = &self.provider {
            if configuration.provider != *provider {
                configuration.provider = provider.clone();
                changed = true;
            }
        }
        if let Some(prompt_id) = &self.prompt_id {
            if configuration.prompt_id != *prompt_id {
                configuration.prompt_id = prompt_id.clone();
                changed = true;
            }
        }
        changed
    }
}

/// One submitted or queued analysis job.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Unique identifier; local until the server confirms the submission.
    pub id: JobId,
    /// Path or reference of the input file. Immutable.
    pub source_file: String,
    /// Display name derived from the source file.
    pub file_name: String,
    /// MIME type of the source file, if detectable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Current lifecycle state.
    pub status: JobState,
    /// Normalized completion fraction in [0, 1]; meaningful only while processing.
    pub progress: f64,
    /// Retry counter, bounded by the configured max attempts.
    pub attempt: u32,
    /// When the job was created (client-side for optimistic records).
    pub created_at: DateTime<Utc>,
    /// When processing started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason; present only while the status is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// True until the server confirms the record with a durable id.
    pub is_local_optimistic: bool,
    /// Analysis configuration.
    pub configuration: JobConfiguration,
    /// Event time of the last applied status/progress/error update.
    /// Stale incoming updates (older event time) are discarded against this.
    pub last_event_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a local-optimistic pending record for a just-submitted file.
    pub fn new_local(source_file: &str, configuration: JobConfiguration, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new_local(),
            source_file: source_file.to_string(),
            file_name: derive_file_name(source_file),
            mime_type: detect_mime_type(source_file),
            status: JobState::Pending,
            progress: 0.0,
            attempt: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_detail: None,
            is_local_optimistic: true,
            configuration,
            last_event_at: now,
        }
    }

    /// Returns true if this job is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Extracts a display name from a file path or reference.
pub fn derive_file_name(source_file: &str) -> String {
    Path::new(source_file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source_file.to_string())
}

/// Detects the MIME type from the file extension using the mime_guess crate.
/// Returns `None` for unknown extensions.
pub fn detect_mime_type(source_file: &str) -> Option<String> {
    mime_guess::from_path(source_file).first().map(|m| m.to_string())
}
