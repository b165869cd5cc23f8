//! Error types for instrument communication.
//!
//! This module defines [`LinkError`], the single typed error surfaced by the
//! transport, the command/response engine and the motion coordinator. Using the
//! `thiserror` crate it keeps failure modes distinct, because callers react to
//! them differently:
//!
//! - **`Timeout`**: no complete frame arrived within the budget. The only
//!   variant that may be retried, and only at the caller's discretion.
//! - **`MalformedResponse`** / **`UnexpectedResponse`**: bytes arrived but were
//!   not the reply that was asked for. Replaying a command the device partially
//!   processed can double-execute a motion step, so these are never retried
//!   blindly.
//! - **`Rejected`**: the device explicitly refused the command.
//! - **`Busy`** / **`BusyTimeout`**: motion bookkeeping.
//! - **`Io`**: the transport itself failed.
//!
//! Application layers (driver factories, configuration loading, the CLI) wrap
//! these in `anyhow::Error` with context.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`LinkError`].
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Coarse classification of a [`LinkError`], used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkErrorKind {
    Timeout,
    MalformedResponse,
    UnexpectedResponse,
    Rejected,
    Busy,
    BusyTimeout,
    Io,
    Configuration,
    Unsupported,
    TaskFailed,
}

impl std::fmt::Display for LinkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LinkErrorKind::Timeout => "timeout",
            LinkErrorKind::MalformedResponse => "malformed_response",
            LinkErrorKind::UnexpectedResponse => "unexpected_response",
            LinkErrorKind::Rejected => "rejected",
            LinkErrorKind::Busy => "busy",
            LinkErrorKind::BusyTimeout => "busy_timeout",
            LinkErrorKind::Io => "io",
            LinkErrorKind::Configuration => "configuration",
            LinkErrorKind::Unsupported => "unsupported",
            LinkErrorKind::TaskFailed => "task_failed",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for instrument communication.
#[derive(Error, Debug)]
pub enum LinkError {
    /// No complete frame was observed within the caller's budget.
    ///
    /// **Error Type**: Transient.
    ///
    /// **Recovery Strategy**: The round trip has been abandoned and the
    /// transport purged. The caller may retry with a longer budget.
    #[error("Timed out after {elapsed:?} waiting for reply to '{command}'")]
    Timeout {
        /// Label of the command that went unanswered
        command: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// The codec rejected the received bytes.
    ///
    /// **Error Type**: Permanent for this round trip.
    ///
    /// **Recovery Strategy**: Do not replay the command blindly; re-query state.
    #[error("Malformed response to '{command}': {reason}")]
    MalformedResponse {
        /// Label of the command being answered
        command: String,
        /// What the codec objected to
        reason: String,
    },

    /// A well-formed frame arrived whose signature matches neither the
    /// command's primary nor alternate signature.
    ///
    /// **Error Type**: Usually transient (an unsolicited device message).
    ///
    /// **Recovery Strategy**: Re-query status rather than replaying.
    #[error("Unexpected response to '{command}': expected {expected}, received {received}")]
    UnexpectedResponse {
        /// Label of the command being answered
        command: String,
        /// Signature(s) that would have been accepted
        expected: String,
        /// Signature actually received
        received: String,
    },

    /// The device explicitly refused the command.
    ///
    /// **Recovery Strategy**: Not retried automatically.
    #[error("Command '{command}' rejected by device: {reason}")]
    Rejected {
        /// Label of the rejected command
        command: String,
        /// Device-provided reason
        reason: String,
    },

    /// A motion is already in flight (or its outcome has not been consumed).
    ///
    /// **Recovery Strategy**: Wait for the motion, consume its outcome, or cancel.
    #[error("Axis '{0}' is busy with an in-flight motion")]
    Busy(String),

    /// `wait_until_idle` exceeded its budget.
    #[error("Device still busy after waiting {0:?}")]
    BusyTimeout(Duration),

    /// Transport-level failure, propagated immediately.
    ///
    /// **Source**: Wraps `std::io::Error`.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration for a transport, codec or driver.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The protocol does not offer the requested operation (e.g. no stop command).
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// A spawned motion task ended without reporting an outcome.
    #[error("Motion task failed: {0}")]
    TaskFailed(String),
}

impl LinkError {
    /// Build a [`LinkError::Timeout`].
    pub fn timeout(command: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            command: command.into(),
            elapsed,
        }
    }

    /// Build a [`LinkError::MalformedResponse`].
    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`LinkError::Rejected`].
    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> LinkErrorKind {
        match self {
            LinkError::Timeout { .. } => LinkErrorKind::Timeout,
            LinkError::MalformedResponse { .. } => LinkErrorKind::MalformedResponse,
            LinkError::UnexpectedResponse { .. } => LinkErrorKind::UnexpectedResponse,
            LinkError::Rejected { .. } => LinkErrorKind::Rejected,
            LinkError::Busy(_) => LinkErrorKind::Busy,
            LinkError::BusyTimeout(_) => LinkErrorKind::BusyTimeout,
            LinkError::Io(_) => LinkErrorKind::Io,
            LinkError::Configuration(_) => LinkErrorKind::Configuration,
            LinkError::Unsupported(_) => LinkErrorKind::Unsupported,
            LinkError::TaskFailed(_) => LinkErrorKind::TaskFailed,
        }
    }

    /// Whether a caller may reasonably retry the same command.
    ///
    /// Only timeouts qualify; everything else either already reached the
    /// device or cannot succeed without a change of state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }
}
