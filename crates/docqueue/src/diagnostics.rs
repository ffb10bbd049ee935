//! Reconciliation diagnostics.
//!
//! Discarded stale updates are an expected outcome of the last-writer-wins
//! rule, not errors; they are counted here for observability and never
//! surfaced to observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared diagnostic counters. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    stale_updates_discarded: AtomicU64,
    illegal_transitions_rejected: AtomicU64,
    malformed_push_payloads: AtomicU64,
    commands_rejected: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub stale_updates_discarded: u64,
    pub illegal_transitions_rejected: u64,
    pub malformed_push_payloads: u64,
    pub commands_rejected: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stale_updates(&self, n: u64) {
        if n > 0 {
            self.inner.stale_updates_discarded.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_illegal_transitions(&self, n: u64) {
        if n > 0 {
            self.inner
                .illegal_transitions_rejected
                .fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_malformed_push_payload(&self) {
        self.inner.malformed_push_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_rejected(&self) {
        self.inner.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            stale_updates_discarded: self.inner.stale_updates_discarded.load(Ordering::Relaxed),
            illegal_transitions_rejected: self
                .inner
                .illegal_transitions_rejected
                .load(Ordering::Relaxed),
            malformed_push_payloads: self.inner.malformed_push_payloads.load(Ordering::Relaxed),
            commands_rejected: self.inner.commands_rejected.load(Ordering::Relaxed),
        }
    }
}
