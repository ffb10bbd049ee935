//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the synchronization engine.
///
/// All fields have sensible defaults; host applications typically
/// deserialize this from their own settings file and override a field or
/// two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Pull interval while the push channel is down, in seconds.
    /// Kept between 10 and 15 seconds to bound backend load.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long a just-submitted local record survives a full snapshot
    /// that does not contain it yet, in seconds.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,
    /// Maximum retry attempts per job, mirrored from the server config.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Age after which terminal records are evicted from memory, in seconds.
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
    /// Eviction sweep interval, in seconds.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Per-request timeout for snapshot and command calls, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Base delay for push-channel reconnect backoff, in milliseconds.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Cap for push-channel reconnect backoff, in milliseconds.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Capacity of the queue event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_poll_interval_secs() -> u64 {
    12
}

fn default_grace_window_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_terminal_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_eviction_interval_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            grace_window_secs: default_grace_window_secs(),
            max_attempts: default_max_attempts(),
            terminal_retention_secs: default_terminal_retention_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }

    pub fn terminal_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.terminal_retention_secs as i64)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}
