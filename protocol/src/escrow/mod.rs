//! # Escrow Module
//!
//! Off-chain bookkeeping for on-chain escrows. The Escrow program holds
//! the buyer's money; this module holds everything else: who bought what,
//! which transaction funded it, and the decryption key once the publisher
//! has been paid.
//!
//! ```text
//! state.rs    - EscrowState, EscrowStatus, filters, statistics
//! machine.rs  - EscrowStateMachine: open, confirm, release, refund,
//!               resume, sweep
//! ```
//!
//! The only shared mutable state in the marketplace lives here. Writers
//! take a per-escrow async lock; readers get snapshot copies.

pub mod machine;
pub mod state;

use thiserror::Error;

use crate::storage::StoreError;
use crate::transaction::ProtocolError;

pub use machine::{escrow_id, EscrowListener, EscrowStateMachine};
pub use state::{
    EscrowFilter, EscrowState, EscrowStatistics, EscrowStatus, PurchaseRequest, ReleasedKey, SettlementInFlight,
};

#[derive(Debug, Error)]
pub enum EscrowError {
    /// The escrow already left `pending`. Retrying will never help.
    #[error("escrow {escrow_id} is {status}, not pending")]
    StateConflict {
        escrow_id: String,
        status: EscrowStatus,
    },

    /// A release or refund was already accepted by the ledger. Resume it
    /// instead of submitting another.
    #[error("escrow {escrow_id} has settlement {txn_id} in flight")]
    SettlementInFlight { escrow_id: String, txn_id: String },

    #[error("escrow not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EscrowError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EscrowError::Protocol(e) => e.is_retryable(),
            EscrowError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
