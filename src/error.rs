//! Error types at the ledger and connector seams

use thiserror::Error;

use crate::retry::{classify_error, ErrorClass};
use crate::types::{TransferId, TransferState};

/// Errors returned by an `EventLedger`
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The compare-and-swap lost: another task moved the transfer first.
    /// Callers treat this as contention and re-read.
    #[error("stale state for transfer {id}: expected {expected}, found {actual}")]
    StaleState {
        id: TransferId,
        expected: TransferState,
        actual: TransferState,
    },

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("transition {from} -> {to} is not permitted")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_stale(&self) -> bool {
        matches!(self, LedgerError::StaleState { .. })
    }
}

/// Failure to prepare or broadcast a destination transaction
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Retryable with backoff (RPC outage, underpriced, nonce race)
    #[error("transient submission failure: {0}")]
    Transient(String),

    /// Retrying cannot succeed (contract rejection, bad parameters)
    #[error("permanent submission failure: {0}")]
    Permanent(String),
}

impl SubmitError {
    /// Build from a raw RPC/provider error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::Permanent => SubmitError::Permanent(message),
            _ => SubmitError::Transient(message),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SubmitError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SubmitError::Transient(m) | SubmitError::Permanent(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_classification() {
        assert!(SubmitError::from_message("execution reverted: paused").is_permanent());
        assert!(!SubmitError::from_message("connection refused").is_permanent());
        assert!(!SubmitError::from_message("weird").is_permanent());
        assert_eq!(
            SubmitError::from_message("nonce too low").message(),
            "nonce too low"
        );
    }

    #[test]
    fn test_stale_state_display() {
        let err = LedgerError::StaleState {
            id: crate::types::TransferId([0u8; 32]),
            expected: TransferState::Confirmed,
            actual: TransferState::Submitting,
        };
        assert!(err.is_stale());
        assert!(err.to_string().contains("expected confirmed, found submitting"));
    }
}
