use crate::retry::{RetryError, Retryable};
use serde::Serialize;
use thiserror::Error;

/// Errors produced while scanning.
///
/// Fetch and validation failures are retried by the caller; once the retry budget is spent
/// they surface as [`ScanError::RetriesExhausted`] and are recorded against the block. Only
/// [`ScanError::Fatal`] ends a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// A node call did not answer within the per-call timeout.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The node transport returned an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node does not (yet) have the requested data.
    #[error("{0} not found")]
    NotFound(String),

    /// The block body holds a different number of transactions than the node declared.
    #[error("block {block}: declared {declared} transactions, parsed {parsed}")]
    TxCountMismatch {
        block: u64,
        declared: usize,
        parsed: usize,
    },

    #[error("malformed receipt for {tx_hash}: {reason}")]
    MalformedReceipt { tx_hash: String, reason: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ScanError> },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A worker task panicked or was aborted.
    #[error("worker failed: {0}")]
    Worker(String),
}

/// Serializable classification of a [`ScanError`], as listed in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    TransientFetch,
    Validation,
    Persistence,
    Fatal,
    Internal,
}

impl ScanError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ScanError::Transport(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Timeout { .. } | ScanError::Transport(_) | ScanError::NotFound(_) => {
                ErrorKind::TransientFetch
            }
            ScanError::TxCountMismatch { .. } | ScanError::MalformedReceipt { .. } => {
                ErrorKind::Validation
            }
            ScanError::RetriesExhausted { last, .. } => last.kind(),
            ScanError::Persistence(_) => ErrorKind::Persistence,
            ScanError::Fatal(_) => ErrorKind::Fatal,
            ScanError::InvalidConfig(_) | ScanError::InvalidState(_) | ScanError::Worker(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl Retryable for ScanError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanError::Timeout { .. }
                | ScanError::Transport(_)
                | ScanError::NotFound(_)
                | ScanError::TxCountMismatch { .. }
                | ScanError::MalformedReceipt { .. }
        )
    }
}

impl From<RetryError<ScanError>> for ScanError {
    fn from(error: RetryError<ScanError>) -> Self {
        match error {
            RetryError::Exhausted { attempts, last } => ScanError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Terminal(err) => err,
        }
    }
}

impl From<tokio::task::JoinError> for ScanError {
    fn from(error: tokio::task::JoinError) -> Self {
        ScanError::Worker(error.to_string())
    }
}

/// Failure reported by a [`crate::sink::PersistenceSink`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Worth retrying: connection problems, server-side errors.
    #[error("transient sink error: {0}")]
    Transient(String),

    /// The sink refused the record; retrying will not help.
    #[error("sink rejected record: {0}")]
    Rejected(String),
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl From<RetryError<SinkError>> for ScanError {
    fn from(error: RetryError<SinkError>) -> Self {
        match error {
            RetryError::Exhausted { attempts, last } => {
                ScanError::Persistence(format!("{last} (after {attempts} attempts)"))
            }
            RetryError::Terminal(err) => ScanError::Persistence(err.to_string()),
        }
    }
}

impl From<csv::Error> for SinkError {
    fn from(error: csv::Error) -> Self {
        if error.is_io_error() {
            SinkError::Transient(error.to_string())
        } else {
            SinkError::Rejected(error.to_string())
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                SinkError::Rejected(error.to_string())
            }
            _ => SinkError::Transient(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_retries_keep_the_underlying_kind() {
        let err = ScanError::from(RetryError::Exhausted {
            attempts: 3,
            last: ScanError::TxCountMismatch {
                block: 7,
                declared: 2,
                parsed: 1,
            },
        });
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejected_sink_errors_are_not_retried() {
        assert!(!SinkError::Rejected("bad row".into()).is_retryable());
        assert!(SinkError::Transient("503".into()).is_retryable());
    }
}
