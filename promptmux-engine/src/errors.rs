//! Error types for the engine layer
//!
//! This module defines the error taxonomy shared by the whole system. Every
//! fallible operation returns [`EngineError`]; classifiers (retry policy,
//! circuit breaker) consume the taxonomy through [`EngineError::is_retryable`]
//! and [`EngineError::implicates_engine`] rather than matching on strings.

use thiserror::Error;

use crate::types::ErrorKind;

/// Main error type for the engine layer and everything built on top of it.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Engine executable missing, not executable, or working directory invalid
    #[error("failed to spawn engine process: {detail}")]
    SpawnFailed {
        /// What went wrong while spawning
        detail: String,
    },

    /// Authentication failure detected in engine stderr or message payload
    #[error("engine authentication failed: {detail}")]
    AuthFailed {
        /// Matched diagnostic from the engine
        detail: String,
    },

    /// The account behind the configured credentials is out of credits
    #[error("insufficient credits for this request")]
    InsufficientCredits,

    /// The engine process exited while a request expected more output
    #[error("engine process crashed (exit code {exit_code:?})")]
    ProcessCrashed {
        /// Exit code if the process exited normally; `None` on signal death
        exit_code: Option<i32>,
        /// Whether any message of the in-flight request had already been
        /// delivered; crashes after the first message are not retryable
        after_first_message: bool,
    },

    /// The engine violated the line-framed JSON protocol (oversized line,
    /// truncated stream)
    #[error("stream protocol violation: {detail}")]
    StreamProtocol {
        /// Protocol violation description
        detail: String,
    },

    /// Deadline exceeded
    #[error("deadline exceeded after {elapsed_ms} ms")]
    Timeout {
        /// Milliseconds elapsed when the deadline fired
        elapsed_ms: u64,
    },

    /// The caller cancelled the request
    #[error("request cancelled by caller")]
    Cancelled,

    /// No pooled session became available within the acquire timeout
    #[error("session pool exhausted")]
    PoolExhausted,

    /// The per-key circuit breaker is open
    #[error("circuit breaker open; retry after {retry_after_ms} ms")]
    CircuitOpen {
        /// Milliseconds until the breaker half-opens
        retry_after_ms: u64,
    },

    /// A caller-supplied configuration value is out of range or malformed
    #[error("invalid configuration: {detail}")]
    InvalidConfig {
        /// Which knob was rejected and why
        detail: String,
    },

    /// A facade lookup referenced an unknown session or request
    #[error("{what} not found: {id}")]
    NotFound {
        /// Entity class ("session", "request")
        what: &'static str,
        /// The id that failed to resolve
        id: String,
    },

    /// Unexpected invariant violation; logged at highest severity
    #[error("internal error: {detail}")]
    Internal {
        /// Description of the violated invariant
        detail: String,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a new SpawnFailed error
    pub fn spawn_failed(detail: impl Into<String>) -> Self {
        Self::SpawnFailed {
            detail: detail.into(),
        }
    }

    /// Create a new StreamProtocol error
    pub fn stream_protocol(detail: impl Into<String>) -> Self {
        Self::StreamProtocol {
            detail: detail.into(),
        }
    }

    /// Create a new Internal error
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Create a new InvalidConfig error
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Whether the dispatcher may transparently retry the request on a fresh
    /// session.
    ///
    /// Crashes are only retryable while nothing of the response has been
    /// observed; once a subscriber saw output, a retry would duplicate it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProcessCrashed {
                after_first_message,
                ..
            } => !after_first_message,
            Self::Timeout { .. } | Self::PoolExhausted => true,
            _ => false,
        }
    }

    /// Whether this failure implicates the engine behind a compatibility key
    /// and should count toward that key's circuit breaker.
    ///
    /// Admission failures (pool exhaustion, an already-open breaker, a
    /// deadline spent queueing) and caller cancellation say nothing about the
    /// engine's health.
    pub fn implicates_engine(&self) -> bool {
        matches!(
            self,
            Self::ProcessCrashed {
                after_first_message: false,
                ..
            }
        )
    }

    /// Stable machine-readable label for events and metrics.
    ///
    /// A crash after the first delivered message surfaces as
    /// `PartialFailure`: the caller already saw part of a response and must
    /// not treat a retry as safe, unlike a crash before any output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::InsufficientCredits => ErrorKind::InsufficientCredits,
            Self::ProcessCrashed {
                after_first_message: true,
                ..
            } => ErrorKind::PartialFailure,
            Self::ProcessCrashed { .. } => ErrorKind::ProcessCrashed,
            Self::StreamProtocol { .. } => ErrorKind::StreamProtocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::PoolExhausted => ErrorKind::PoolExhausted,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

// Channel endpoints disappearing mid-operation is always an internal fault:
// the owning task is gone.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::internal("channel receiver dropped")
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for EngineError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::internal("channel sender dropped")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_before_first_message_is_retryable() {
        let before = EngineError::ProcessCrashed {
            exit_code: Some(1),
            after_first_message: false,
        };
        let after = EngineError::ProcessCrashed {
            exit_code: Some(1),
            after_first_message: true,
        };
        assert!(before.is_retryable());
        assert!(!after.is_retryable());
    }

    #[test]
    fn admission_failures_are_retryable_but_do_not_implicate_engine() {
        assert!(EngineError::PoolExhausted.is_retryable());
        assert!(!EngineError::PoolExhausted.implicates_engine());
        assert!(EngineError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(!EngineError::Timeout { elapsed_ms: 10 }.implicates_engine());
        assert!(
            EngineError::ProcessCrashed {
                exit_code: None,
                after_first_message: false
            }
            .implicates_engine()
        );
    }

    #[test]
    fn terminal_failures_are_not_retryable() {
        assert!(
            !EngineError::AuthFailed {
                detail: "bad token".into()
            }
            .is_retryable()
        );
        assert!(!EngineError::InsufficientCredits.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::stream_protocol("line too long").is_retryable());
        assert!(!EngineError::invalid_config("max_turns").is_retryable());
    }

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(
            EngineError::spawn_failed("missing").kind(),
            ErrorKind::SpawnFailed
        );
        assert_eq!(
            EngineError::CircuitOpen { retry_after_ms: 5 }.kind().to_string(),
            "circuit_open"
        );
    }

    #[test]
    fn crash_after_first_message_surfaces_as_partial_failure() {
        let before = EngineError::ProcessCrashed {
            exit_code: Some(1),
            after_first_message: false,
        };
        let after = EngineError::ProcessCrashed {
            exit_code: Some(1),
            after_first_message: true,
        };
        assert_eq!(before.kind(), ErrorKind::ProcessCrashed);
        assert_eq!(after.kind(), ErrorKind::PartialFailure);
        assert_eq!(after.kind().to_string(), "partial_failure");
    }
}
