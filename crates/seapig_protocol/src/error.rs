//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not have the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Frame carries an action this protocol version does not know.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// Subscription pattern could not be compiled.
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The pattern text.
        pattern: String,
        /// Why it was rejected.
        message: String,
    },

    /// JSON serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates a malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}
