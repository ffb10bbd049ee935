//! Reconciliation of authoritative server state into the local collection.
//!
//! All functions here mutate the single `HashMap<JobId, JobRecord>` owned
//! by the engine actor and report what changed, so one incoming payload
//! produces at most one notification. Stale and illegal updates are
//! discarded, counted and logged, never applied and never fatal.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{JobId, JobRecord, JobState};
use crate::transport::wire::{JobDelta, RemoteJob};

/// What one reconciliation pass did to the collection.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Ids whose observable fields changed (inserted or merged).
    pub changed: Vec<JobId>,
    /// Ids removed from the collection.
    pub removed: Vec<JobId>,
    /// Delta ids with no local record; the actor answers with a refresh.
    pub unknown: Vec<JobId>,
    /// Updates discarded by the last-writer-wins rule. Expected, not an error.
    pub stale_discarded: u64,
    /// Updates discarded because they violated the transition table.
    pub illegal_discarded: u64,
}

impl ReconcileOutcome {
    /// True if observers should be notified.
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.removed.is_empty()
    }

    fn absorb(&mut self, other: ReconcileOutcome) {
        self.changed.extend(other.changed);
        self.removed.extend(other.removed);
        self.unknown.extend(other.unknown);
        self.stale_discarded += other.stale_discarded;
        self.illegal_discarded += other.illegal_discarded;
    }
}

enum MergeDisposition {
    Changed,
    Unchanged,
    Stale,
    Illegal,
}

/// Applies a full pull snapshot.
///
/// `protected` holds local ids whose submit is still in flight; those and
/// failed-before-acknowledged local records survive a snapshot that does
/// not contain them, as does any local-optimistic record younger than
/// `grace`.
pub fn apply_snapshot(
    map: &mut HashMap<JobId, JobRecord>,
    remote: Vec<RemoteJob>,
    protected: &HashSet<JobId>,
    grace: chrono::Duration,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let _span = tracing::info_span!("engine.reconcile", kind = "snapshot").entered();
    let mut outcome = ReconcileOutcome::default();

    let mut seen: HashSet<JobId> = HashSet::with_capacity(remote.len());
    for job in remote {
        seen.insert(job.id.clone());
        let upserted = upsert_authoritative(map, job.into_record());
        outcome.absorb(upserted);
    }

    // Records absent from a full snapshot are gone server-side
    let absent: Vec<JobId> = map
        .keys()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();
    for id in absent {
        let keep = map
            .get(&id)
            .map(|record| {
                record.is_local_optimistic
                    && (protected.contains(&id)
                        || record.status == JobState::Failed
                        || now - record.created_at < grace)
            })
            .unwrap_or(false);
        if !keep {
            map.remove(&id);
            outcome.removed.push(id);
        }
    }

    outcome
}

/// Applies a batch of push deltas.
pub fn apply_deltas(
    map: &mut HashMap<JobId, JobRecord>,
    deltas: Vec<JobDelta>,
    received_at: DateTime<Utc>,
) -> ReconcileOutcome {
    let _span = tracing::info_span!("engine.reconcile", kind = "delta").entered();
    let mut outcome = ReconcileOutcome::default();

    for delta in deltas {
        match map.get_mut(&delta.id) {
            None => {
                log::debug!("Delta for unknown job {}, scheduling refresh", delta.id);
                outcome.unknown.push(delta.id);
            }
            Some(existing) => match merge_delta(existing, &delta, received_at) {
                MergeDisposition::Changed => outcome.changed.push(delta.id),
                MergeDisposition::Unchanged => {}
                MergeDisposition::Stale => outcome.stale_discarded += 1,
                MergeDisposition::Illegal => outcome.illegal_discarded += 1,
            },
        }
    }

    outcome
}

/// Rebinds a local-optimistic record to the durable id returned by a
/// submit acknowledgement. If the authoritative record already arrived via
/// pull or push, the local duplicate simply goes away.
pub fn apply_submit_ack(
    map: &mut HashMap<JobId, JobRecord>,
    local_id: &JobId,
    durable_id: JobId,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let Some(mut record) = map.remove(local_id) else {
        return outcome;
    };
    outcome.removed.push(local_id.clone());

    if map.contains_key(&durable_id) {
        log::debug!(
            "Submit ack for {} raced with snapshot; dropping local duplicate {}",
            durable_id,
            local_id
        );
        return outcome;
    }

    record.id = durable_id.clone();
    record.is_local_optimistic = false;
    // Not a status event: the LWW clock stays put so any authoritative
    // update since creation still applies
    map.insert(durable_id.clone(), record);
    outcome.changed.push(durable_id);
    outcome
}

/// Removes terminal records older than the retention window. Pure local
/// memory bounding; never calls the delete endpoint.
pub fn evict_expired(
    map: &mut HashMap<JobId, JobRecord>,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let expired: Vec<JobId> = map
        .values()
        .filter(|record| record.is_finished())
        .filter(|record| now - record.completed_at.unwrap_or(record.last_event_at) >= retention)
        .map(|record| record.id.clone())
        .collect();

    for id in expired {
        log::debug!("Evicting terminal job {} past retention", id);
        map.remove(&id);
        outcome.removed.push(id);
    }

    outcome
}

/// Returns all records sorted newest first.
pub fn sorted_snapshot(map: &HashMap<JobId, JobRecord>) -> Vec<JobRecord> {
    let mut records: Vec<JobRecord> = map.values().cloned().collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

fn upsert_authoritative(
    map: &mut HashMap<JobId, JobRecord>,
    incoming: JobRecord,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    // Dedup rule: an older local-optimistic record for the same source file
    // is displaced by the server-confirmed one
    let local_duplicate = map
        .values()
        .filter(|record| {
            record.is_local_optimistic
                && record.id.is_local()
                && record.source_file == incoming.source_file
                && record.created_at <= incoming.created_at
        })
        .min_by(|a, b| a.created_at.cmp(&b.created_at))
        .map(|record| record.id.clone());
    if let Some(local_id) = local_duplicate {
        map.remove(&local_id);
        outcome.removed.push(local_id);
    }

    match map.entry(incoming.id.clone()) {
        Entry::Occupied(mut entry) => match merge_authoritative(entry.get_mut(), &incoming) {
            MergeDisposition::Changed => outcome.changed.push(incoming.id),
            MergeDisposition::Unchanged => {}
            MergeDisposition::Stale => outcome.stale_discarded += 1,
            MergeDisposition::Illegal => outcome.illegal_discarded += 1,
        },
        Entry::Vacant(entry) => {
            outcome.changed.push(incoming.id.clone());
            entry.insert(incoming);
        }
    }

    outcome
}

fn merge_authoritative(existing: &mut JobRecord, incoming: &JobRecord) -> MergeDisposition {
    if incoming.last_event_at < existing.last_event_at {
        log::debug!(
            "Discarding stale update for job {} ({} < {})",
            existing.id,
            incoming.last_event_at,
            existing.last_event_at
        );
        return MergeDisposition::Stale;
    }
    if !existing.status.can_transition_to(incoming.status) {
        log::warn!(
            "Discarding illegal transition for job {}: {} -> {}",
            existing.id,
            existing.status,
            incoming.status
        );
        return MergeDisposition::Illegal;
    }

    let before = existing.clone();

    existing.status = incoming.status;
    existing.progress = incoming.progress;
    existing.attempt = incoming.attempt;
    existing.error_detail = if incoming.status == JobState::Failed {
        incoming.error_detail.clone()
    } else {
        None
    };
    existing.started_at = incoming.started_at.or(before.started_at);
    if incoming.status == JobState::Processing && existing.started_at.is_none() {
        existing.started_at = Some(incoming.last_event_at);
    }
    existing.completed_at = if incoming.status.is_terminal() {
        incoming
            .completed_at
            .or(before.completed_at)
            .or(Some(incoming.last_event_at))
    } else {
        None
    };
    // Configuration is frozen once the job left pending
    if before.status == JobState::Pending {
        existing.configuration = incoming.configuration.clone();
    }
    existing.is_local_optimistic = false;
    existing.last_event_at = incoming.last_event_at;

    changed_disposition(existing, &before)
}

fn merge_delta(
    existing: &mut JobRecord,
    delta: &JobDelta,
    received_at: DateTime<Utc>,
) -> MergeDisposition {
    let event_time = delta.event_time.unwrap_or(received_at);
    if event_time < existing.last_event_at {
        log::debug!(
            "Discarding stale delta for job {} ({} < {})",
            existing.id,
            event_time,
            existing.last_event_at
        );
        return MergeDisposition::Stale;
    }

    let new_status = delta.status.unwrap_or(existing.status);
    if !existing.status.can_transition_to(new_status) {
        log::warn!(
            "Discarding illegal transition for job {}: {} -> {}",
            existing.id,
            existing.status,
            new_status
        );
        return MergeDisposition::Illegal;
    }

    let before = existing.clone();

    existing.status = new_status;
    if let Some(progress) = delta.progress {
        existing.progress = progress.clamp(0.0, 1.0);
    }
    if new_status == JobState::Failed {
        if let Some(message) = &delta.error_message {
            existing.error_detail = Some(message.clone());
        }
    } else {
        existing.error_detail = None;
    }
    if new_status == JobState::Processing && existing.started_at.is_none() {
        existing.started_at = Some(event_time);
    }
    existing.completed_at = if new_status.is_terminal() {
        delta
            .completed_at
            .or(before.completed_at)
            .or(Some(event_time))
    } else {
        None
    };
    existing.last_event_at = event_time;

    changed_disposition(existing, &before)
}

/// Compares observable fields only: a pure event-clock bump with no field
/// change must not notify observers.
fn changed_disposition(after: &JobRecord, before: &JobRecord) -> MergeDisposition {
    let mut comparable = after.clone();
    comparable.last_event_at = before.last_event_at;
    if comparable == *before {
        MergeDisposition::Unchanged
    } else {
        MergeDisposition::Changed
    }
}
