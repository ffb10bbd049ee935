//! Queue change broadcasting for observers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::JobId;

/// Notification emitted after a reconciliation pass or command outcome.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum QueueEvent {
    /// Records whose observable fields changed, batched per pass.
    /// Emitted at most once per incoming payload; no-op passes are silent.
    Changed {
        updated: Vec<JobId>,
        removed: Vec<JobId>,
    },
    /// The server explicitly refused a command for this job.
    CommandRejected { id: JobId, reason: String },
}

/// Broadcasts queue events to all subscribers.
#[derive(Clone)]
pub struct QueueEventBroadcaster {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEventBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: QueueEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for QueueEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
