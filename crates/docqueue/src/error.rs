use thiserror::Error;

use crate::engine::dispatch::CommandError;
use crate::model::IllegalTransition;
use crate::transport::error::TransportError;

/// Top-level error type for library consumers.
#[derive(Error, Debug)]
pub enum DocqueueError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Transition error: {0}")]
    Transition(#[from] IllegalTransition),
}

pub type Result<T> = std::result::Result<T, DocqueueError>;
