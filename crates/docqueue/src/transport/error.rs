//! Transport-specific error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transport adapter.
///
/// These are network-level failures. A server that processed a command and
/// explicitly refused it is *not* a transport error; see
/// [`CommandReply::Rejected`](super::wire::CommandReply).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode server payload: {0}")]
    Decode(String),

    #[error("push channel closed")]
    ChannelClosed,
}

impl TransportError {
    /// Returns true for failures worth retrying (network trouble, timeouts,
    /// server-side errors). Client errors (4xx) are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(_) | TransportError::Timeout(_) | TransportError::ChannelClosed => {
                true
            }
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}
