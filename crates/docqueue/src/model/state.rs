//! Job lifecycle states and the transition table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of an analysis job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Returns true for states a job can never leave on its own.
    /// `Failed` is terminal too, but re-enterable via the retry command.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Returns true if moving from `self` to `to` is allowed by the
    /// transition table. Same-state "transitions" (e.g. a progress update
    /// while processing) are not transitions and are always allowed.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (JobState::Pending, JobState::Processing)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Processing, JobState::Paused)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
                | (JobState::Processing, JobState::Cancelled)
                | (JobState::Paused, JobState::Processing)
                | (JobState::Paused, JobState::Cancelled)
                | (JobState::Failed, JobState::Pending)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Paused => write!(f, "paused"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A requested or incoming state change that the transition table forbids.
///
/// Never propagated to observers: the offending update is discarded, the
/// existing record kept, and the event recorded as a diagnostic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal job state transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Checks a transition against the fixed table.
pub fn check_transition(from: JobState, to: JobState) -> Result<(), IllegalTransition> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}
