//! Error types for the client engine.

use seapig_protocol::{ProtocolError, SlaveVersion};
use std::time::Duration;
use thiserror::Error;

/// Result type for client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing objects.
///
/// Connection-level faults heal themselves through reconnects. Consistency
/// faults are fatal: the invariant they protect cannot be restored without
/// outside intervention.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport closed underneath us.
    #[error("transport closed: {reason}")]
    TransportClosed {
        /// Close reason reported by the transport.
        reason: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Nothing was heard from the coordinator for too long.
    #[error("no traffic for {elapsed:?}, heartbeat timed out")]
    HeartbeatTimeout {
        /// Silence observed when the check fired.
        elapsed: Duration,
    },

    /// An incremental update did not build on the local version.
    #[error(
        "object {id} lost updates: update builds on version {declared} but local version is {local}"
    )]
    ProtocolViolation {
        /// Concrete object id.
        id: String,
        /// Version the local replica holds.
        local: SlaveVersion,
        /// Version the update declared as its base.
        declared: SlaveVersion,
    },

    /// The coordinator sent an action the client does not understand.
    #[error("coordinator sent an unsupported message: {0}")]
    UnsupportedMessage(String),

    /// A produce request reached a master with neither a value nor a producer.
    #[error("master {id} has to either be initialized at all times or have a producer")]
    MisconfiguredProducer {
        /// Concrete object id.
        id: String,
    },

    /// A patch could not be applied to the local replica.
    #[error("patch for object {id} could not be applied: {message}")]
    PatchFailed {
        /// Concrete object id.
        id: String,
        /// Failure reported by the patch engine.
        message: String,
    },

    /// Subscription options were inconsistent.
    #[error("invalid subscription {pattern}: {reason}")]
    InvalidSubscription {
        /// Pattern being registered.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No producer is registered for this id.
    #[error("no producer registered for {0}")]
    UnknownProducer(String),

    /// Not connected.
    #[error("not connected to coordinator")]
    NotConnected,

    /// The session task has stopped.
    #[error("session closed")]
    SessionClosed,

    /// Frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid-subscription error.
    pub fn invalid_subscription(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSubscription {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if a reconnect can recover from this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::TransportClosed { .. } | SyncError::HeartbeatTimeout { .. } => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the error means local state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ProtocolViolation { .. }
                | SyncError::UnsupportedMessage(_)
                | SyncError::MisconfiguredProducer { .. }
                | SyncError::PatchFailed { .. }
                | SyncError::Protocol(_)
        )
    }
}
