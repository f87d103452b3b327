//! Error hierarchy and failure classification.
//!
//! - [`TransportError`]: failures of a single send/probe/close on a transport
//! - [`EngineError`]: failures surfaced by engine operations
//! - [`ReportError`]: failures of an injected error reporter
//! - [`ErrorClassification`] / [`ErrorSeverity`]: the taxonomy every
//!   classified failure is tagged with before it reaches a reporter

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ConnectionId, IdentityKey};

// ─────────────────────────────────────────────────────────────────────────────
// Severity and classification
// ─────────────────────────────────────────────────────────────────────────────

/// How urgently a classified failure needs attention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Informational, no operator action.
    Low,
    /// Recovered locally; worth a warning.
    Medium,
    /// A connection is effectively dead.
    High,
    /// Will not self-heal; operators must act.
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Kind of failure raised by the liveness, cleanup and reconnection paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClassification {
    /// Unexpected failure inside a probe loop. The loop keeps running.
    HeartbeatLoopError,
    /// A probe send/receive failed. That connection's heartbeat task stops.
    HeartbeatError,
    /// Consecutive missed probes reached the threshold.
    HeartbeatTimeout,
    /// Reconnection attempts are exhausted or the failure is not retryable.
    ReconnectionPermanentFailure,
    /// A cleanup tick failed. The loop backs off and retries.
    CleanupTickError,
}

impl ErrorClassification {
    /// All classifications, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::HeartbeatLoopError,
        Self::HeartbeatError,
        Self::HeartbeatTimeout,
        Self::ReconnectionPermanentFailure,
        Self::CleanupTickError,
    ];

    /// Severity this classification is reported with.
    #[must_use]
    pub fn severity(self) -> ErrorSeverity {
        match self {
            Self::HeartbeatLoopError | Self::HeartbeatError | Self::CleanupTickError => {
                ErrorSeverity::Medium
            }
            Self::HeartbeatTimeout => ErrorSeverity::High,
            Self::ReconnectionPermanentFailure => ErrorSeverity::Critical,
        }
    }

    /// Whether this is a signal callers and operators are expected to act on.
    ///
    /// Everything else is recovered locally and only recorded.
    #[must_use]
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            Self::HeartbeatTimeout | Self::ReconnectionPermanentFailure
        )
    }

    /// Wire name, e.g. `HEARTBEAT_TIMEOUT`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatLoopError => "HEARTBEAT_LOOP_ERROR",
            Self::HeartbeatError => "HEARTBEAT_ERROR",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::ReconnectionPermanentFailure => "RECONNECTION_PERMANENT_FAILURE",
            Self::CleanupTickError => "CLEANUP_TICK_ERROR",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of a single operation on a transport handle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the local side already closed the transport.
    #[error("transport closed")]
    Closed,

    /// No response before the deadline.
    #[error("transport timed out after {after_ms}ms")]
    Timeout {
        /// How long the caller waited.
        after_ms: u64,
    },

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Underlying I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end refused the connection or frame outright
    /// (e.g. authentication rejected). Retrying will not help.
    #[error("rejected by peer: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether a fresh attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EngineError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No registered connection with this id.
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    /// Admission refused because the registry is full.
    #[error("connection limit reached ({limit})")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },

    /// A transport operation failed for a specific connection.
    #[error("transport error on {connection_id}: {source}")]
    Transport {
        /// Connection the operation targeted.
        connection_id: ConnectionId,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },

    /// Reconnection is switched off in configuration.
    #[error("reconnection is disabled")]
    ReconnectionDisabled,

    /// The identity is latched in permanent failure until reset.
    #[error("reconnection permanently failed for {0}")]
    PermanentFailure(IdentityKey),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wrap a transport failure with the connection it happened on.
    #[must_use]
    pub fn transport(connection_id: ConnectionId, source: TransportError) -> Self {
        Self::Transport {
            connection_id,
            source,
        }
    }

    /// Classification this error maps to when it escapes a monitored loop,
    /// if any.
    #[must_use]
    pub fn classification(&self) -> Option<ErrorClassification> {
        match self {
            Self::Transport { .. } => Some(ErrorClassification::HeartbeatError),
            Self::PermanentFailure(_) => Some(ErrorClassification::ReconnectionPermanentFailure),
            Self::Internal(_) => Some(ErrorClassification::HeartbeatLoopError),
            Self::NotFound(_)
            | Self::CapacityExceeded { .. }
            | Self::ReconnectionDisabled
            | Self::Cancelled => None,
        }
    }

    /// Severity derived from [`Self::classification`], `Low` when unclassified.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        self.classification()
            .map_or(ErrorSeverity::Low, ErrorClassification::severity)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ─────────────────────────────────────────────────────────────────────────────
// ReportError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of an injected error reporter. Always swallowed by the caller.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The reporter's sink is gone (e.g. receiver dropped).
    #[error("reporter queue closed")]
    QueueClosed,

    /// The reporter could not deliver the report.
    #[error("reporter unavailable: {0}")]
    Unavailable(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
