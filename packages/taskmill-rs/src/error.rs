//! Structured error types for the taskmill engine.
//!
//! `TaskmillError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Worker loops route on the variant:
//!
//! - `TransientInfrastructure` → log at warn, back off, keep looping
//! - `PermanentDomain` → poison the row, log at error
//! - `LeaseLost` → abort the batch, re-acquire before continuing
//! - `InvalidInput` / `Config` → surface to the caller, never retried
//!
//! `anyhow` remains the internal transport inside store implementations and
//! handlers; the variant is what crosses worker boundaries.

use std::time::Duration;

use thiserror::Error;

/// Error taxonomy the engine distinguishes at its boundaries.
#[derive(Debug, Error)]
pub enum TaskmillError {
    /// Malformed arguments or missing required configuration. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Signature or timestamp verification failed for an inbound event.
    /// The event is not stored unless a rejection-retention policy is enabled.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Connection loss, timeout, deadlock, serialization failure. Recovered
    /// locally with retry and backoff.
    #[error("transient infrastructure failure: {0}")]
    TransientInfrastructure(#[source] anyhow::Error),

    /// The handler reported the work can never succeed. The row transitions
    /// to `Poisoned`.
    #[error("permanent domain failure: {0}")]
    PermanentDomain(String),

    /// Renewal failed or a fencing-token conflict was observed. In-flight
    /// work for the lease must be abandoned without acking.
    #[error("lease lost for {resource}")]
    LeaseLost { resource: String },

    /// Misconfiguration detected at build/registration time.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TaskmillError {
    /// Whether a worker loop should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskmillError::TransientInfrastructure(_))
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        TaskmillError::InvalidInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TaskmillError::Config(msg.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        TaskmillError::TransientInfrastructure(err.into())
    }
}

/// Outcome a handler reports for one message.
///
/// Unhandled handler errors are treated as `Transient` with no explicit
/// delay; the component's backoff policy supplies one.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The message was processed; ack it.
    Success,
    /// The work is valid but cannot complete now; reschedule.
    /// An explicit delay overrides the backoff policy for this attempt.
    Transient(Option<Duration>),
    /// The work can never succeed; poison the row.
    Permanent(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}

pub type Result<T> = std::result::Result<T, TaskmillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(TaskmillError::transient(anyhow::anyhow!("timeout")).is_retryable());
        assert!(!TaskmillError::invalid_input("bad").is_retryable());
        assert!(!TaskmillError::PermanentDomain("no".into()).is_retryable());
        assert!(!TaskmillError::LeaseLost {
            resource: "r".into()
        }
        .is_retryable());
    }

    #[test]
    fn handler_outcome_success_helper() {
        assert!(HandlerOutcome::Success.is_success());
        assert!(!HandlerOutcome::Transient(None).is_success());
        assert!(!HandlerOutcome::Permanent("x".into()).is_success());
    }
}
