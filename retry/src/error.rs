//! Error types surfaced by the retry coordinator
//!
//! Only these variants ever reach a caller. Fix-flow failures are soft and
//! are reported through [`crate::fix::FixOutcome`] instead.

use std::time::Duration;

use ckit_async_utils::CancelErr;
use thiserror::Error;

/// Retry coordinator result type alias
pub type Result<T> = std::result::Result<T, RetryError>;

/// Final outcome of a coordinated operation that did not succeed
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every permitted attempt failed with a retryable error
    #[error("{operation} failed after {attempts} attempts: {last:#}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },

    /// The wrapped function failed with an error that must not be retried
    #[error("{operation} failed with non-retryable error on attempt {attempts}: {source:#}")]
    NonRetryable {
        operation: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The operation class's breaker refused the call; the function never ran
    #[error("circuit breaker open for {operation}, next probe in {retry_in:?}")]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    /// The caller's scope was cancelled or its deadline passed
    #[error("{operation} aborted after {attempts} attempts: {cause}")]
    Cancelled {
        operation: String,
        attempts: u32,
        cause: CancelErr,
    },

    #[error("internal retry coordinator fault: {0}")]
    Internal(String),
}

impl RetryError {
    /// Attempts actually made before this error was produced.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
            RetryError::CircuitOpen { .. } | RetryError::Internal(_) => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    pub fn cancel_cause(&self) -> Option<CancelErr> {
        match self {
            RetryError::Cancelled { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// The underlying failure of the last attempt, when there was one.
    pub fn last_error(&self) -> Option<&anyhow::Error> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::NonRetryable { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_carries_count_and_cause() {
        let err = RetryError::Exhausted {
            operation: "docker".to_string(),
            attempts: 3,
            last: anyhow::anyhow!("connection refused").context("pull base image"),
        };

        let msg = err.to_string();
        assert!(msg.contains('3'), "{msg}");
        assert!(msg.contains("connection refused"), "{msg}");
        assert!(msg.contains("pull base image"), "{msg}");
        assert_eq!(err.attempts(), 3);
    }

    #[test]
    fn cancelled_exposes_cause() {
        let err = RetryError::Cancelled {
            operation: "network".to_string(),
            attempts: 1,
            cause: CancelErr::DeadlineExceeded,
        };

        assert!(err.is_cancelled());
        assert_eq!(err.cancel_cause(), Some(CancelErr::DeadlineExceeded));
        assert!(err.last_error().is_none());
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn circuit_open_reports_no_attempts() {
        let err = RetryError::CircuitOpen {
            operation: "kubernetes".to_string(),
            retry_in: Duration::from_secs(12),
        };

        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), 0);
    }
}
