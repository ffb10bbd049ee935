pub mod broadcast;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod model;
pub mod transport;

pub use broadcast::{QueueEvent, QueueEventBroadcaster};
pub use config::EngineConfig;
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use engine::{
    CommandError, EngineHandle, JobAction, QueueCounts, QueueEngine, ReconcileOutcome,
};
pub use error::{DocqueueError, Result};
pub use model::{
    ConfigurationPatch, IllegalTransition, JobConfiguration, JobId, JobRecord, JobState,
};
pub use transport::{
    CommandAck, CommandKind, CommandReply, CommandRequest, HttpTransport, JobDelta, PushEvent,
    RemoteJob, SubscriptionHandle, TransportAdapter, TransportError,
};
