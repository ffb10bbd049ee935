//! Job record model: queue entry shapes and the state transition table.

pub mod record;
pub mod state;

pub use record::{
    derive_file_name, detect_mime_type, ConfigurationPatch, JobConfiguration, JobId, JobRecord,
};
pub use state::{check_transition, IllegalTransition, JobState};
