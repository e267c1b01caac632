//! # Market Module
//!
//! The user-facing flows, wired from the pieces below them:
//!
//! ```text
//! publish.rs      - seal → blob store → register → promote
//! marketplace.rs  - purchase → escrow → release → download
//! names.rs        - `.desci` names on the name registry
//! ```
//!
//! Both follow the same two-phase shape as the transaction protocol: a
//! `prepare_*` call that returns something for the user's wallet to sign,
//! and a `confirm_*` / `open_*` call that takes the signed bytes back. The
//! one-shot helpers (`publish`, `purchase`) exist for callers that hold a
//! [`TransactionSigner`](crate::transaction::TransactionSigner) in process.

pub mod marketplace;
pub mod names;
pub mod publish;

use thiserror::Error;

use crate::crypto::layers::LayerError;
use crate::escrow::EscrowError;
use crate::storage::StoreError;
use crate::transaction::ProtocolError;

pub use marketplace::{Marketplace, PreparedPurchase};
pub use names::{NameCall, NameOutcome, NameReceipt, NameService};
pub use publish::{PreparedPublish, PublishFlow, PublishRequest};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("validation error: {0}")]
    Validation(String),

    /// The register transaction was already accepted; resume it.
    #[error("pending model {pending_id} has register {txn_id} in flight")]
    RegisterInFlight { pending_id: String, txn_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("sealing failed: {0}")]
    Layer(#[from] LayerError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A blocking sealing task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Protocol(e) => e.is_retryable(),
            PublishError::Escrow(e) => e.is_retryable(),
            PublishError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors from the [`Marketplace`] facade.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unsealing failed: {0}")]
    Layer(#[from] LayerError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn is_retryable(&self) -> bool {
        match self {
            MarketError::Publish(e) => e.is_retryable(),
            MarketError::Escrow(e) => e.is_retryable(),
            MarketError::Protocol(e) => e.is_retryable(),
            MarketError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_is_inherited_through_wrappers() {
        let timeout = ProtocolError::ConfirmationTimeout {
            tx_id: "tx-1".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(PublishError::Protocol(timeout.clone()).is_retryable());
        assert!(MarketError::Publish(PublishError::Protocol(timeout)).is_retryable());
        assert!(!MarketError::Escrow(EscrowError::NotFound("e".into())).is_retryable());
        assert!(!PublishError::Validation("empty".into()).is_retryable());
    }
}
