//! Broadcasting modules for real-time queue events.

pub mod queue_events;

pub use queue_events::{QueueEvent, QueueEventBroadcaster};
