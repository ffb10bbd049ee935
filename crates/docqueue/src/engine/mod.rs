//! The synchronization engine.
//!
//! A single-writer actor task owns the authoritative `HashMap<JobId,
//! JobRecord>`. Everything else (user commands, push deltas, snapshot
//! fetches, command completions) is funneled into the actor as messages,
//! so structural mutation never needs a lock. Handles only read watch
//! snapshots and send commands.
//!
//! Push and poll cooperate through one channel-health flag: while the push
//! channel is down the actor polls the snapshot endpoint on a fixed
//! interval, and stops as soon as the channel reports healthy again (after
//! one catch-up fetch to cover the gap).

pub mod dispatch;
pub mod reconcile;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::broadcast::{QueueEvent, QueueEventBroadcaster};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::model::{ConfigurationPatch, JobConfiguration, JobId, JobRecord, JobState};
use crate::transport::wire::{CommandKind, CommandReply, CommandRequest, RemoteJob};
use crate::transport::{PushEvent, TransportAdapter, TransportError};

pub use dispatch::{CommandError, JobAction};
pub use reconcile::ReconcileOutcome;

/// Capacity of the handle-to-actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the internal completion/push channel.
const INTERNAL_CHANNEL_CAPACITY: usize = 256;

/// Record counts per state, for status displays.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

enum EngineCmd {
    Submit {
        source_file: String,
        configuration: JobConfiguration,
        reply: oneshot::Sender<Result<JobId, CommandError>>,
    },
    Act {
        id: JobId,
        action: JobAction,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Refresh,
    Shutdown,
}

enum InternalEvent {
    SnapshotFetched(Result<Vec<RemoteJob>, TransportError>),
    CommandFinished {
        id: JobId,
        kind: CommandKind,
        undo: dispatch::Undo,
        result: Result<CommandReply, TransportError>,
    },
}

/// Spawns the engine actor.
pub struct QueueEngine;

impl QueueEngine {
    /// Starts the engine with a constructor-injected transport and returns
    /// a cloneable handle. The actor stops when `shutdown()` is called or
    /// every handle is dropped.
    pub fn spawn(transport: Arc<dyn TransportAdapter>, config: EngineConfig) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let events = QueueEventBroadcaster::new(config.event_capacity);
        let diagnostics = Diagnostics::new();

        let subscription = transport.subscribe(push_tx);

        let actor = EngineActor {
            transport,
            config,
            map: HashMap::new(),
            in_flight: HashMap::new(),
            snapshot_inflight: false,
            push_healthy: false,
            snapshot_tx,
            events: events.clone(),
            diagnostics: diagnostics.clone(),
            internal_tx,
        };

        tokio::spawn(run_actor(actor, cmd_rx, internal_rx, push_rx, subscription));

        EngineHandle {
            cmd_tx,
            snapshot_rx,
            events,
            diagnostics,
        }
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCmd>,
    snapshot_rx: watch::Receiver<Vec<JobRecord>>,
    events: QueueEventBroadcaster,
    diagnostics: Diagnostics,
}

impl EngineHandle {
    /// Submits a file for analysis. The local-optimistic record is visible
    /// in the snapshot as soon as this returns; the network call completes
    /// in the background and reconciliation rebinds the durable id.
    pub async fn submit(
        &self,
        source_file: &str,
        configuration: JobConfiguration,
    ) -> Result<JobId, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::Submit {
                source_file: source_file.to_string(),
                configuration,
                reply,
            })
            .await
            .map_err(|_| CommandError::EngineClosed)?;
        rx.await.map_err(|_| CommandError::EngineClosed)?
    }

    /// Retries a failed job. Rejected locally, with no network call, when
    /// the attempt count reached the configured maximum.
    pub async fn retry(&self, id: JobId) -> Result<(), CommandError> {
        self.act(id, JobAction::Retry).await
    }

    /// Pauses a processing job.
    pub async fn pause(&self, id: JobId) -> Result<(), CommandError> {
        self.act(id, JobAction::Pause).await
    }

    /// Resumes a paused job.
    pub async fn resume(&self, id: JobId) -> Result<(), CommandError> {
        self.act(id, JobAction::Resume).await
    }

    /// Cancels a pending, processing or paused job. The record shows
    /// cancelled immediately; a server rejection reverts it.
    pub async fn cancel(&self, id: JobId) -> Result<(), CommandError> {
        self.act(id, JobAction::Cancel).await
    }

    /// Deletes a terminal job from the queue.
    pub async fn delete(&self, id: JobId) -> Result<(), CommandError> {
        self.act(id, JobAction::Delete).await
    }

    /// Updates the configuration of a pending job.
    pub async fn update_configuration(
        &self,
        id: JobId,
        patch: ConfigurationPatch,
    ) -> Result<(), CommandError> {
        self.act(id, JobAction::UpdateConfiguration(patch)).await
    }

    async fn act(&self, id: JobId, action: JobAction) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::Act { id, action, reply })
            .await
            .map_err(|_| CommandError::EngineClosed)?;
        rx.await.map_err(|_| CommandError::EngineClosed)?
    }

    /// Requests a snapshot fetch, coalesced with any fetch already in flight.
    pub async fn refresh(&self) -> Result<(), CommandError> {
        self.cmd_tx
            .send(EngineCmd::Refresh)
            .await
            .map_err(|_| CommandError::EngineClosed)
    }

    /// Stops the engine. In-flight network calls are discarded on arrival.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCmd::Shutdown).await;
    }

    /// Read-only copy of the reconciled queue, newest first. Synchronous.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.snapshot_rx.borrow().clone()
    }

    /// Returns one record by id, if present.
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.snapshot_rx
            .borrow()
            .iter()
            .find(|record| record.id == *id)
            .cloned()
    }

    /// Record counts per state.
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.snapshot_rx.borrow().iter() {
            match record.status {
                JobState::Pending => counts.pending += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Paused => counts.paused += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Subscribes to change notifications. At most one `Changed` event is
    /// emitted per reconciliation pass; no-op passes are silent.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Current diagnostic counters.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

struct EngineActor {
    transport: Arc<dyn TransportAdapter>,
    config: EngineConfig,
    map: HashMap<JobId, JobRecord>,
    /// One in-flight command per job; repeats coalesce to a no-op.
    in_flight: HashMap<JobId, CommandKind>,
    snapshot_inflight: bool,
    push_healthy: bool,
    snapshot_tx: watch::Sender<Vec<JobRecord>>,
    events: QueueEventBroadcaster,
    diagnostics: Diagnostics,
    internal_tx: mpsc::Sender<InternalEvent>,
}

async fn run_actor(
    mut actor: EngineActor,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    mut internal_rx: mpsc::Receiver<InternalEvent>,
    mut push_rx: mpsc::Receiver<PushEvent>,
    subscription: crate::transport::SubscriptionHandle,
) {
    log::info!("Queue engine started");

    let mut poll = tokio::time::interval(actor.config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    poll.tick().await; // skip immediate first tick
    let mut eviction = tokio::time::interval(actor.config.eviction_interval());
    eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    eviction.tick().await;

    // Prime the collection before the first poll tick
    actor.start_snapshot_fetch();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(EngineCmd::Shutdown) => break,
                Some(EngineCmd::Submit { source_file, configuration, reply }) => {
                    actor.handle_submit(source_file, configuration, reply);
                }
                Some(EngineCmd::Act { id, action, reply }) => {
                    actor.handle_act(id, action, reply);
                }
                Some(EngineCmd::Refresh) => actor.start_snapshot_fetch(),
            },
            Some(event) = internal_rx.recv() => actor.handle_internal(event),
            Some(event) = push_rx.recv() => actor.handle_push(event),
            _ = poll.tick() => {
                if !actor.push_healthy {
                    actor.start_snapshot_fetch();
                }
            }
            _ = eviction.tick() => actor.run_eviction(),
        }
    }

    subscription.cancel();
    log::info!("Queue engine stopped");
}

impl EngineActor {
    fn handle_submit(
        &mut self,
        source_file: String,
        configuration: JobConfiguration,
        reply: oneshot::Sender<Result<JobId, CommandError>>,
    ) {
        let now = Utc::now();
        let (id, prepared) =
            dispatch::apply_submit(&mut self.map, &source_file, configuration, now);
        log::info!("Submitting {} as job {}", source_file, id);

        self.publish_changes(prepared.changed, prepared.removed);
        if let Some(request) = prepared.request {
            self.in_flight.insert(id.clone(), CommandKind::Submit);
            self.launch_command(id.clone(), CommandKind::Submit, prepared.undo, request);
        }
        let _ = reply.send(Ok(id));
    }

    fn handle_act(
        &mut self,
        id: JobId,
        action: JobAction,
        reply: oneshot::Sender<Result<(), CommandError>>,
    ) {
        if let Some(kind) = self.in_flight.get(&id) {
            // One in-flight command per job: repeats are a no-op, anything
            // else is refused
            let result = if *kind == action.kind() {
                log::debug!("Coalescing repeated {} for job {}", kind, id);
                Ok(())
            } else {
                Err(CommandError::Busy {
                    id: id.clone(),
                    kind: *kind,
                })
            };
            let _ = reply.send(result);
            return;
        }

        let now = Utc::now();
        match dispatch::apply_action(&mut self.map, &id, &action, self.config.max_attempts, now) {
            Ok(prepared) => {
                self.publish_changes(prepared.changed, prepared.removed);
                if let Some(request) = prepared.request {
                    // Coalescing keys on the user action; completion handling
                    // keys on the wire command (a retried local record goes
                    // out as a fresh submit)
                    let wire_kind = request.kind;
                    self.in_flight.insert(id.clone(), action.kind());
                    self.launch_command(id.clone(), wire_kind, prepared.undo, request);
                }
                let _ = reply.send(Ok(()));
            }
            Err(error) => {
                if matches!(error, CommandError::Rejected { .. }) {
                    self.diagnostics.record_command_rejected();
                }
                let _ = reply.send(Err(error));
            }
        }
    }

    fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected => {
                if !self.push_healthy {
                    self.push_healthy = true;
                    log::info!("Push channel healthy, polling paused");
                    // Catch up on anything missed while disconnected
                    self.start_snapshot_fetch();
                }
            }
            PushEvent::Disconnected => {
                if self.push_healthy {
                    self.push_healthy = false;
                    log::warn!("Push channel down, falling back to polling");
                }
            }
            PushEvent::Malformed => self.diagnostics.record_malformed_push_payload(),
            PushEvent::Deltas(deltas) => {
                let outcome = reconcile::apply_deltas(&mut self.map, deltas, Utc::now());
                self.publish_outcome(outcome);
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::SnapshotFetched(result) => {
                self.snapshot_inflight = false;
                match result {
                    Ok(remote) => {
                        // In-flight commands on local ids are submissions
                        // (or retries re-issued as submissions) the server
                        // has not confirmed yet
                        let protected: HashSet<JobId> = self
                            .in_flight
                            .keys()
                            .filter(|id| id.is_local())
                            .cloned()
                            .collect();
                        let outcome = reconcile::apply_snapshot(
                            &mut self.map,
                            remote,
                            &protected,
                            self.config.grace_window(),
                            Utc::now(),
                        );
                        self.publish_outcome(outcome);
                    }
                    // Retryable by the next poll tick or push recovery
                    Err(error) => log::warn!("Queue snapshot fetch failed: {}", error),
                }
            }
            InternalEvent::CommandFinished {
                id,
                kind,
                undo,
                result,
            } => self.handle_command_finished(id, kind, undo, result),
        }
    }

    fn handle_command_finished(
        &mut self,
        id: JobId,
        kind: CommandKind,
        undo: dispatch::Undo,
        result: Result<CommandReply, TransportError>,
    ) {
        self.in_flight.remove(&id);

        match result {
            Ok(CommandReply::Ack(ack)) => {
                if kind == CommandKind::Submit {
                    match ack.id {
                        Some(durable) => {
                            log::debug!("Submission {} confirmed as {}", id, durable);
                            let outcome =
                                reconcile::apply_submit_ack(&mut self.map, &id, durable);
                            self.publish_outcome(outcome);
                        }
                        None => {
                            log::warn!("Submit ack for {} carried no id, refreshing", id);
                            self.start_snapshot_fetch();
                        }
                    }
                }
                // Other acks need no local effect: the optimistic state
                // stands and authoritative updates arrive via push/pull
            }
            Ok(CommandReply::Rejected { reason }) => {
                self.diagnostics.record_command_rejected();
                log::warn!("Server rejected {} for job {}: {}", kind, id, reason);
                if kind == CommandKind::Submit {
                    self.mark_submit_failed(&id, reason.clone());
                } else {
                    let outcome = dispatch::revert(&mut self.map, &id, undo);
                    self.publish_outcome(outcome);
                }
                self.events.send(QueueEvent::CommandRejected { id, reason });
            }
            Err(error) => {
                if kind == CommandKind::Submit {
                    log::warn!("Submission {} failed on the network: {}", id, error);
                    self.mark_submit_failed(&id, "submission failed".to_string());
                } else {
                    // The server never saw the command; roll the optimistic
                    // effect back and let the user retry
                    log::warn!(
                        "{} for job {} failed on the network, rolling back: {}",
                        kind,
                        id,
                        error
                    );
                    let outcome = dispatch::revert(&mut self.map, &id, undo);
                    self.publish_outcome(outcome);
                }
            }
        }
    }

    /// Marks a local submission as failed. The record keeps
    /// `is_local_optimistic` so the user can retry without re-entering the
    /// configuration.
    fn mark_submit_failed(&mut self, id: &JobId, detail: String) {
        let now = Utc::now();
        if let Some(record) = self.map.get_mut(id) {
            record.status = JobState::Failed;
            record.error_detail = Some(detail);
            record.completed_at = Some(now);
            record.last_event_at = now;
            self.publish_changes(vec![id.clone()], vec![]);
        }
    }

    fn run_eviction(&mut self) {
        let outcome = reconcile::evict_expired(
            &mut self.map,
            self.config.terminal_retention(),
            Utc::now(),
        );
        self.publish_outcome(outcome);
    }

    fn start_snapshot_fetch(&mut self) {
        if self.snapshot_inflight {
            log::debug!("Snapshot fetch already in flight, coalescing");
            return;
        }
        self.snapshot_inflight = true;

        let transport = Arc::clone(&self.transport);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.fetch_snapshot().await;
            // Discarded if the engine is gone
            let _ = internal_tx.send(InternalEvent::SnapshotFetched(result)).await;
        });
    }

    fn launch_command(
        &self,
        id: JobId,
        kind: CommandKind,
        undo: dispatch::Undo,
        request: CommandRequest,
    ) {
        let transport = Arc::clone(&self.transport);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.send_command(request).await;
            // Discarded if the engine is gone
            let _ = internal_tx
                .send(InternalEvent::CommandFinished {
                    id,
                    kind,
                    undo,
                    result,
                })
                .await;
        });
    }

    fn publish_outcome(&mut self, outcome: ReconcileOutcome) {
        self.diagnostics.record_stale_updates(outcome.stale_discarded);
        self.diagnostics
            .record_illegal_transitions(outcome.illegal_discarded);
        if !outcome.unknown.is_empty() {
            self.start_snapshot_fetch();
        }
        if outcome.has_changes() {
            self.notify(outcome.changed, outcome.removed);
        }
    }

    fn publish_changes(&mut self, changed: Vec<JobId>, removed: Vec<JobId>) {
        if !changed.is_empty() || !removed.is_empty() {
            self.notify(changed, removed);
        }
    }

    fn notify(&mut self, updated: Vec<JobId>, removed: Vec<JobId>) {
        let _ = self.snapshot_tx.send(reconcile::sorted_snapshot(&self.map));
        self.events.send(QueueEvent::Changed { updated, removed });
    }
}
