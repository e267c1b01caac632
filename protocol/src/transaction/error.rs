//! Error types for the transaction confirmation protocol.

use std::time::Duration;
use thiserror::Error;

use super::signing::{FrameError, SignerError};
use super::verification::TransactionError;
use crate::ledger::GatewayError;

/// Everything `prepare` / `submit` / `confirm` can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Bad caller input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The gateway refused the submission, or the bytes were unusable.
    /// The caller may rebuild and resubmit.
    #[error("submission failed: {0}")]
    Submission(String),

    /// Poll budget exhausted. Not fatal: the transaction may still land,
    /// so re-poll `tx_id` with a fresh budget instead of resubmitting.
    #[error("confirmation of {tx_id} timed out after {timeout:?}")]
    ConfirmationTimeout { tx_id: String, timeout: Duration },

    /// The ledger evicted the transaction from its pool.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("confirmation cancelled")]
    Cancelled,

    /// A log field the flow depends on is missing or malformed.
    #[error("log field absent: {0}")]
    FieldAbsent(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("insufficient funds: {address} can spend {spendable}, needs {required}")]
    InsufficientFunds {
        address: String,
        spendable: u64,
        required: u64,
    },
}

impl ProtocolError {
    /// Whether the same request might succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Submission(_)
                | ProtocolError::ConfirmationTimeout { .. }
                | ProtocolError::Gateway(GatewayError::Unavailable(_))
        )
    }
}

impl From<FrameError> for ProtocolError {
    fn from(e: FrameError) -> Self {
        ProtocolError::Submission(e.to_string())
    }
}

impl From<TransactionError> for ProtocolError {
    fn from(e: TransactionError) -> Self {
        ProtocolError::Submission(e.to_string())
    }
}
