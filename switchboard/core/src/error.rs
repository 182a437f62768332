//! Session Error Taxonomy
//!
//! Every failure a caller of the session API can observe. Transport-level
//! failures normally never reach callers directly: they drive the retry state
//! machine, and only its terminal outcome (`RetryExhausted`) is surfaced.

use thiserror::Error;

use crate::services::ServiceError;
use crate::transport::TransportError;

/// Errors surfaced by the session API
#[derive(Debug, Error)]
pub enum ChatError {
    /// Identity could not be established; fatal to session start
    #[error("Identity error: {0}")]
    Identity(String),

    /// No counterpart is available yet; callers render this as "waiting"
    #[error("Assignment unavailable: {0}")]
    Assignment(String),

    /// A transport operation was attempted without a live channel
    #[error("Not connected")]
    NotConnected,

    /// The session cannot send yet (not connected or not paired)
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Rejected local input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The retry ceiling was hit; identity/pairing must be re-resolved
    #[error("Connection retries exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Consecutive failed attempts
        attempts: u32,
    },

    /// Transport failure outside the retry state machine
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The session actor has shut down
    #[error("Session closed")]
    SessionClosed,
}

impl ChatError {
    /// Whether the caller can keep using the session after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Identity(_) | Self::RetryExhausted { .. } | Self::SessionClosed
        )
    }

    /// Map an identity-service failure
    pub(crate) fn identity(err: &ServiceError) -> Self {
        Self::Identity(err.to_string())
    }
}
