//! # Ledger Gateway
//!
//! The narrow seam between the marketplace and whatever ledger node it
//! talks to. Four calls, nothing else:
//!
//! | Call            | Used by                                   |
//! |-----------------|-------------------------------------------|
//! | `get_params`    | `prepare`: fee, current round, genesis id |
//! | `submit_raw`    | `submit`: already-signed bytes            |
//! | `pending_info`  | `confirm`: confirmed round, logs, errors  |
//! | `account_info`  | purchase pre-check: spendable balance     |
//!
//! The core never signs, never gossips, never follows consensus. It shapes
//! requests and reads answers. The in-process implementation lives in the
//! `desci-contracts` crate as `SimulatedLedger`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport-level trouble. The confirm loop treats this as "not yet".
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the submission outright.
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Suggested parameters for a new transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    pub fee: u64,
    pub min_fee: u64,
    pub last_round: u64,
    pub genesis_id: String,
}

/// What the ledger knows about a submitted transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    /// Set once the transaction is in a block.
    pub confirmed_round: Option<u64>,
    /// Set if the pool evicted the transaction. Terminal.
    pub pool_error: Option<String>,
    /// Application log lines emitted while executing the transaction.
    pub logs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    pub balance: u64,
    pub min_balance: u64,
}

impl AccountInfo {
    /// Balance available to spend without dropping under the minimum.
    pub fn spendable(&self) -> u64 {
        self.balance.saturating_sub(self.min_balance)
    }
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn get_params(&self) -> Result<NetworkParams, GatewayError>;

    /// Submit signed, framed transaction bytes. Returns the id of the first
    /// transaction in the submission.
    async fn submit_raw(&self, raw: &[u8]) -> Result<String, GatewayError>;

    async fn pending_info(&self, tx_id: &str) -> Result<PendingInfo, GatewayError>;

    async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError>;
}
