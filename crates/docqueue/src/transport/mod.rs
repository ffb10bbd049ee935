//! Transport adapter: pull snapshots, push updates, command delivery.
//!
//! The engine talks to the queue backend exclusively through the
//! [`TransportAdapter`] trait so tests (and alternative backends) can
//! inject their own implementation.

pub mod error;
pub mod http;
pub mod sse;
pub mod wire;

pub use error::TransportError;
pub use http::HttpTransport;
pub use wire::{
    parse_push_payload, CommandAck, CommandKind, CommandReply, CommandRequest, JobDelta, RemoteJob,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events delivered by the push subscription task.
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// The push channel is (re)connected and healthy.
    Connected,
    /// A batch of incremental updates.
    Deltas(Vec<JobDelta>),
    /// A payload failed to parse and was dropped.
    Malformed,
    /// The push channel went down; reconnection is underway.
    Disconnected,
}

/// Handle to an open push subscription.
///
/// Cancelling (or dropping) aborts the background task. Events already in
/// flight after cancellation are discarded by the receiver going away.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stops the subscription and its reconnect loop.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Abstraction over the queue backend.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Full pull of the current server-side queue state. Idempotent; the
    /// engine coalesces overlapping calls so at most one is in flight.
    async fn fetch_snapshot(&self) -> Result<Vec<RemoteJob>, TransportError>;

    /// Delivers a user command. A server that refused the command yields
    /// `Ok(CommandReply::Rejected { .. })`; network failure yields `Err`.
    async fn send_command(&self, request: CommandRequest) -> Result<CommandReply, TransportError>;

    /// Opens the push channel, delivering events into `updates` until the
    /// returned handle is cancelled. Implementations reconnect on failure
    /// with exponential backoff and report health transitions.
    fn subscribe(&self, updates: mpsc::Sender<PushEvent>) -> SubscriptionHandle;
}
