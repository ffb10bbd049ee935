//! Optimistic command application.
//!
//! Every user command mutates the collection optimistically and records an
//! undo, then goes out over the transport. Server rejection or network
//! failure reverts the undo; authoritative confirmation arrives through
//! normal reconciliation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    ConfigurationPatch, IllegalTransition, JobConfiguration, JobId, JobRecord, JobState,
};
use crate::transport::error::TransportError;
use crate::transport::wire::{CommandKind, CommandRequest};

use super::reconcile::ReconcileOutcome;

/// Failure of a user command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The server, or a local pre-check such as the retry bound, refused
    /// the command.
    #[error("command rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Illegal(#[from] IllegalTransition),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// A different command for this job is still in flight.
    #[error("job {id} is busy with an in-flight {kind} command")]
    Busy { id: JobId, kind: CommandKind },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("engine is shut down")]
    EngineClosed,
}

/// User actions on an existing job.
#[derive(Debug, Clone)]
pub enum JobAction {
    Retry,
    Pause,
    Resume,
    Cancel,
    Delete,
    UpdateConfiguration(ConfigurationPatch),
}

impl JobAction {
    pub fn kind(&self) -> CommandKind {
        match self {
            JobAction::Retry => CommandKind::Retry,
            JobAction::Pause => CommandKind::Pause,
            JobAction::Resume => CommandKind::Resume,
            JobAction::Cancel => CommandKind::Cancel,
            JobAction::Delete => CommandKind::Delete,
            JobAction::UpdateConfiguration(_) => CommandKind::UpdateConfiguration,
        }
    }
}

/// How to roll back an optimistic mutation if the server refuses it.
#[derive(Debug, Clone)]
pub enum Undo {
    /// Nothing to roll back.
    None,
    /// Restore the record to its pre-command state, unless a newer
    /// authoritative update superseded the optimistic one.
    Restore {
        before: Box<JobRecord>,
        applied_at: DateTime<Utc>,
    },
    /// Re-insert a record removed by delete.
    Reinsert(Box<JobRecord>),
}

/// An optimistic mutation ready to go out over the transport.
#[derive(Debug)]
pub struct PreparedCommand {
    /// Request to deliver; `None` for purely local commands (deleting a
    /// record the server never knew about).
    pub request: Option<CommandRequest>,
    pub undo: Undo,
    /// Observable changes made by the optimistic mutation.
    pub changed: Vec<JobId>,
    pub removed: Vec<JobId>,
}

/// Creates the local-optimistic record for a submission and the submit
/// request. The record appears synchronously; the network call follows.
pub fn apply_submit(
    map: &mut HashMap<JobId, JobRecord>,
    source_file: &str,
    configuration: JobConfiguration,
    now: DateTime<Utc>,
) -> (JobId, PreparedCommand) {
    let record = JobRecord::new_local(source_file, configuration, now);
    let id = record.id.clone();
    let request = CommandRequest::submit(&record);
    map.insert(id.clone(), record);

    let prepared = PreparedCommand {
        request: Some(request),
        undo: Undo::None,
        changed: vec![id.clone()],
        removed: vec![],
    };
    (id, prepared)
}

/// Validates and optimistically applies an action on an existing job.
pub fn apply_action(
    map: &mut HashMap<JobId, JobRecord>,
    id: &JobId,
    action: &JobAction,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<PreparedCommand, CommandError> {
    let record = map
        .get_mut(id)
        .ok_or_else(|| CommandError::UnknownJob(id.clone()))?;

    match action {
        JobAction::Retry => {
            if record.status != JobState::Failed {
                return Err(IllegalTransition {
                    from: record.status,
                    to: JobState::Pending,
                }
                .into());
            }
            if record.attempt >= max_attempts {
                return Err(CommandError::Rejected {
                    reason: format!(
                        "retry limit reached ({} of {})",
                        record.attempt, max_attempts
                    ),
                });
            }
            let undo = restore_point(record, now);
            record.attempt += 1;
            record.status = JobState::Pending;
            record.progress = 0.0;
            record.error_detail = None;
            record.completed_at = None;
            record.last_event_at = now;

            // A failed local record was never accepted by the server;
            // retrying it re-issues the submission
            let request = if record.is_local_optimistic {
                CommandRequest::submit(record)
            } else {
                CommandRequest::for_job(CommandKind::Retry, id.clone())
            };
            Ok(PreparedCommand {
                request: Some(request),
                undo,
                changed: vec![id.clone()],
                removed: vec![],
            })
        }

        JobAction::Pause => {
            if record.status != JobState::Processing {
                return Err(IllegalTransition {
                    from: record.status,
                    to: JobState::Paused,
                }
                .into());
            }
            let undo = restore_point(record, now);
            record.status = JobState::Paused;
            record.last_event_at = now;
            Ok(PreparedCommand {
                request: Some(CommandRequest::for_job(CommandKind::Pause, id.clone())),
                undo,
                changed: vec![id.clone()],
                removed: vec![],
            })
        }

        JobAction::Resume => {
            if record.status != JobState::Paused {
                return Err(IllegalTransition {
                    from: record.status,
                    to: JobState::Processing,
                }
                .into());
            }
            let undo = restore_point(record, now);
            record.status = JobState::Processing;
            record.last_event_at = now;
            Ok(PreparedCommand {
                request: Some(CommandRequest::for_job(CommandKind::Resume, id.clone())),
                undo,
                changed: vec![id.clone()],
                removed: vec![],
            })
        }

        JobAction::Cancel => {
            if !matches!(
                record.status,
                JobState::Pending | JobState::Processing | JobState::Paused
            ) {
                return Err(IllegalTransition {
                    from: record.status,
                    to: JobState::Cancelled,
                }
                .into());
            }
            let undo = restore_point(record, now);
            record.status = JobState::Cancelled;
            record.completed_at = Some(now);
            record.error_detail = None;
            record.last_event_at = now;

            // A record the server never confirmed has nothing to cancel remotely
            let request = if record.is_local_optimistic {
                None
            } else {
                Some(CommandRequest::for_job(CommandKind::Cancel, id.clone()))
            };
            Ok(PreparedCommand {
                request,
                undo,
                changed: vec![id.clone()],
                removed: vec![],
            })
        }

        JobAction::Delete => {
            if !record.status.is_terminal() {
                return Err(CommandError::Rejected {
                    reason: format!("job in state {} cannot be deleted", record.status),
                });
            }
            let local_only = record.is_local_optimistic;
            let removed = map.remove(id).map(Box::new);
            Ok(PreparedCommand {
                request: if local_only {
                    None
                } else {
                    Some(CommandRequest::for_job(CommandKind::Delete, id.clone()))
                },
                undo: match (local_only, removed) {
                    // Nothing can reject a purely local delete
                    (true, _) | (_, None) => Undo::None,
                    (false, Some(record)) => Undo::Reinsert(record),
                },
                changed: vec![],
                removed: vec![id.clone()],
            })
        }

        JobAction::UpdateConfiguration(patch) => {
            if record.status != JobState::Pending {
                return Err(CommandError::Rejected {
                    reason: format!(
                        "configuration is frozen once a job leaves pending (job is {})",
                        record.status
                    ),
                });
            }
            let undo = restore_point(record, now);
            let changed = patch.apply_to(&mut record.configuration);
            Ok(PreparedCommand {
                request: Some(CommandRequest::update_configuration(id.clone(), patch)),
                undo,
                changed: if changed { vec![id.clone()] } else { vec![] },
                removed: vec![],
            })
        }
    }
}

/// Rolls back an optimistic mutation. Skipped when a newer authoritative
/// update already superseded it.
pub fn revert(map: &mut HashMap<JobId, JobRecord>, id: &JobId, undo: Undo) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    match undo {
        Undo::None => {}
        Undo::Restore { before, applied_at } => {
            let restore = match map.get(id) {
                // Record gone: the server removed it meanwhile, leave it
                None => false,
                Some(current) if current.last_event_at > applied_at => {
                    log::debug!(
                        "Skipping revert of job {}: authoritative update superseded it",
                        id
                    );
                    false
                }
                Some(current) => *current != *before,
            };
            if restore {
                map.insert(id.clone(), *before);
                outcome.changed.push(id.clone());
            }
        }
        Undo::Reinsert(record) => {
            if !map.contains_key(id) {
                map.insert(id.clone(), *record);
                outcome.changed.push(id.clone());
            }
        }
    }
    outcome
}

fn restore_point(record: &JobRecord, applied_at: DateTime<Utc>) -> Undo {
    Undo::Restore {
        before: Box::new(record.clone()),
        applied_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn configuration() -> JobConfiguration {
        JobConfiguration {
            provider: "openai".to_string(),
            prompt_id: "summary".to_string(),
        }
    }

    fn durable_record(id: i64, status: JobState) -> JobRecord {
        let mut record = JobRecord::new_local("/inbox/a.pdf", configuration(), at(0));
        record.id = JobId::Durable(id);
        record.is_local_optimistic = false;
        record.status = status;
        if status.is_terminal() {
            record.completed_at = Some(at(0));
        }
        if status == JobState::Failed {
            record.error_detail = Some("boom".to_string());
        }
        record
    }

    #[test]
    fn test_submit_inserts_pending_local_record() {
        let mut map = HashMap::new();
        let (id, prepared) = apply_submit(&mut map, "/inbox/report.pdf", configuration(), at(1));

        assert!(id.is_local());
        assert_eq!(prepared.changed, vec![id.clone()]);
        let record = &map[&id];
        assert_eq!(record.status, JobState::Pending);
        assert!(record.is_local_optimistic);

        let request = prepared.request.unwrap();
        assert_eq!(request.kind, CommandKind::Submit);
        assert!(request.job_id.is_none());
    }

    #[test]
    fn test_retry_increments_attempt_and_clears_failure() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Failed));

        let prepared =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Retry, 3, at(10)).unwrap();
        let record = &map[&JobId::Durable(1)];
        assert_eq!(record.status, JobState::Pending);
        assert_eq!(record.attempt, 1);
        assert!(record.error_detail.is_none());
        assert!(record.completed_at.is_none());
        assert_eq!(prepared.request.unwrap().kind, CommandKind::Retry);
    }

    #[test]
    fn test_retry_bound_rejected_locally() {
        let mut map = HashMap::new();
        let mut record = durable_record(1, JobState::Failed);
        record.attempt = 3;
        map.insert(JobId::Durable(1), record);

        let error =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Retry, 3, at(10)).unwrap_err();
        assert!(matches!(error, CommandError::Rejected { .. }));
        // No mutation happened
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Failed);
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));
        let error =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Retry, 3, at(10)).unwrap_err();
        assert!(matches!(error, CommandError::Illegal(_)));
    }

    #[test]
    fn test_retry_of_local_record_resubmits() {
        let mut map = HashMap::new();
        let (id, _) = apply_submit(&mut map, "/inbox/report.pdf", configuration(), at(1));
        // Simulate a submission that failed on the network
        if let Some(record) = map.get_mut(&id) {
            record.status = JobState::Failed;
            record.error_detail = Some("submission failed".to_string());
            record.completed_at = Some(at(2));
        }

        let prepared = apply_action(&mut map, &id, &JobAction::Retry, 3, at(10)).unwrap();
        let request = prepared.request.unwrap();
        assert_eq!(request.kind, CommandKind::Submit);
        assert!(map[&id].is_local_optimistic);
    }

    #[test]
    fn test_pause_resume_guards() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));

        apply_action(&mut map, &JobId::Durable(1), &JobAction::Pause, 3, at(5)).unwrap();
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Paused);

        // Pausing again is illegal (not processing anymore)
        let error =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Pause, 3, at(6)).unwrap_err();
        assert!(matches!(error, CommandError::Illegal(_)));

        apply_action(&mut map, &JobId::Durable(1), &JobAction::Resume, 3, at(7)).unwrap();
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Processing);
    }

    #[test]
    fn test_cancel_sets_terminal_state_immediately() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));

        let prepared =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Cancel, 3, at(5)).unwrap();
        let record = &map[&JobId::Durable(1)];
        assert_eq!(record.status, JobState::Cancelled);
        assert_eq!(record.completed_at, Some(at(5)));
        assert_eq!(prepared.request.unwrap().kind, CommandKind::Cancel);
    }

    #[test]
    fn test_cancel_rejected_from_terminal_state() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Completed));
        let error =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Cancel, 3, at(5)).unwrap_err();
        assert!(matches!(error, CommandError::Illegal(_)));
    }

    #[test]
    fn test_cancel_of_local_record_needs_no_network() {
        let mut map = HashMap::new();
        let (id, _) = apply_submit(&mut map, "/inbox/a.pdf", configuration(), at(1));
        let prepared = apply_action(&mut map, &id, &JobAction::Cancel, 3, at(2)).unwrap();
        assert!(prepared.request.is_none());
        assert_eq!(map[&id].status, JobState::Cancelled);
    }

    #[test]
    fn test_delete_only_terminal() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));
        let error =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Delete, 3, at(5)).unwrap_err();
        assert!(matches!(error, CommandError::Rejected { .. }));

        map.insert(JobId::Durable(2), durable_record(2, JobState::Completed));
        let prepared =
            apply_action(&mut map, &JobId::Durable(2), &JobAction::Delete, 3, at(5)).unwrap();
        assert!(!map.contains_key(&JobId::Durable(2)));
        assert_eq!(prepared.removed, vec![JobId::Durable(2)]);
        assert!(matches!(prepared.undo, Undo::Reinsert(_)));
    }

    #[test]
    fn test_update_configuration_only_pending() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Pending));

        let patch = ConfigurationPatch {
            provider: Some("anthropic".to_string()),
            prompt_id: None,
        };
        apply_action(
            &mut map,
            &JobId::Durable(1),
            &JobAction::UpdateConfiguration(patch.clone()),
            3,
            at(5),
        )
        .unwrap();
        assert_eq!(map[&JobId::Durable(1)].configuration.provider, "anthropic");

        map.insert(JobId::Durable(2), durable_record(2, JobState::Processing));
        let error = apply_action(
            &mut map,
            &JobId::Durable(2),
            &JobAction::UpdateConfiguration(patch),
            3,
            at(5),
        )
        .unwrap_err();
        assert!(matches!(error, CommandError::Rejected { .. }));
    }

    #[test]
    fn test_unknown_job() {
        let mut map = HashMap::new();
        let error =
            apply_action(&mut map, &JobId::Durable(9), &JobAction::Cancel, 3, at(5)).unwrap_err();
        assert!(matches!(error, CommandError::UnknownJob(_)));
    }

    #[test]
    fn test_revert_restores_prior_state() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));

        let prepared =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Cancel, 3, at(5)).unwrap();
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Cancelled);

        let outcome = revert(&mut map, &JobId::Durable(1), prepared.undo);
        assert_eq!(outcome.changed, vec![JobId::Durable(1)]);
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Processing);
    }

    #[test]
    fn test_revert_skipped_when_superseded() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(1), durable_record(1, JobState::Processing));

        let prepared =
            apply_action(&mut map, &JobId::Durable(1), &JobAction::Cancel, 3, at(5)).unwrap();

        // An authoritative update lands after the optimistic cancel
        if let Some(record) = map.get_mut(&JobId::Durable(1)) {
            record.status = JobState::Cancelled;
            record.last_event_at = at(9);
        }

        let outcome = revert(&mut map, &JobId::Durable(1), prepared.undo);
        assert!(!outcome.has_changes());
        assert_eq!(map[&JobId::Durable(1)].status, JobState::Cancelled);
    }

    #[test]
    fn test_revert_reinserts_deleted_record() {
        let mut map = HashMap::new();
        map.insert(JobId::Durable(2), durable_record(2, JobState::Completed));
        let prepared =
            apply_action(&mut map, &JobId::Durable(2), &JobAction::Delete, 3, at(5)).unwrap();
        assert!(map.is_empty());

        let outcome = revert(&mut map, &JobId::Durable(2), prepared.undo);
        assert_eq!(outcome.changed, vec![JobId::Durable(2)]);
        assert_eq!(map[&JobId::Durable(2)].status, JobState::Completed);
    }
}
