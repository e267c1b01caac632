//! # Storage Module
//!
//! The marketplace keeps three kinds of state and owns none of the
//! infrastructure behind them:
//!
//! ```text
//! BlobStore    - sealed artifacts, content-addressed (base58 SHA-256)
//! RecordStore  - pending / published models, purchase records
//! EscrowStore  - off-chain escrow records
//! ```
//!
//! Each is a trait. Two families of adapters ship with the crate:
//!
//! ```text
//! memory.rs  - DashMap / Mutex backed, for tests and ephemeral nodes
//! db.rs      - MarketDb, sled trees with bincode values
//! ```
//!
//! ## Design Decisions
//!
//! 1. **Moves are atomic.** Promoting a pending model to published and
//!    completing a purchase each happen in one step. A crash between the
//!    delete and the insert would otherwise leave a model either twice or
//!    nowhere.
//!
//! 2. **Bincode on disk, JSON on the wire.** Same rule as always: serde
//!    enums that hit sled are externally tagged.
//!
//! 3. **Records are never deleted.** Except the pending model, which is
//!    consumed by its promotion.

pub mod db;
pub mod memory;
pub mod records;

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::hash::sha256;
use crate::escrow::EscrowState;

pub use db::MarketDb;
pub use memory::{MemoryBlobStore, MemoryEscrowStore, MemoryRecordStore};
pub use records::{PendingModel, PublishedModel, PurchaseRecord, PurchaseStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The record exists but is not in the state the operation needs.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Storage hiccups are worth retrying; logical conflicts are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Sled(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Content id of a stored blob: base58 of its SHA-256.
pub fn content_id(bytes: &[u8]) -> String {
    bs58::encode(sha256(bytes)).into_string()
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Content-addressed storage for sealed artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return their content id. Idempotent.
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<String>;

    /// Fetch by content id. Missing blobs are `NotFound`.
    async fn get(&self, cid: &str) -> StoreResult<Vec<u8>>;

    async fn exists(&self, cid: &str) -> StoreResult<bool>;
}

pub trait RecordStore: Send + Sync {
    fn put_pending(&self, model: &PendingModel) -> StoreResult<()>;

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingModel>>;

    /// Delete the pending record and insert the published one, atomically.
    /// `NotFound` if the pending record is gone, `Conflict` if the chain
    /// model id is already taken.
    fn promote(&self, pending_id: &str, published: &PublishedModel) -> StoreResult<()>;

    fn get_published(&self, model_id: u64) -> StoreResult<Option<PublishedModel>>;

    fn list_published(&self) -> StoreResult<Vec<PublishedModel>>;

    fn put_purchase(&self, purchase: &PurchaseRecord) -> StoreResult<()>;

    fn get_purchase(&self, escrow_id: &str) -> StoreResult<Option<PurchaseRecord>>;

    /// Move a pending purchase to `status`, recording the settlement
    /// transaction if there was one. `Conflict` if the purchase is not
    /// pending or `status` is.
    fn close_purchase(
        &self,
        escrow_id: &str,
        status: PurchaseStatus,
        settlement: Option<(&str, u64)>,
    ) -> StoreResult<PurchaseRecord>;

    fn complete_purchase(&self, escrow_id: &str, txn_id: &str, round: u64) -> StoreResult<PurchaseRecord> {
        self.close_purchase(escrow_id, PurchaseStatus::Completed, Some((txn_id, round)))
    }
}

/// Why `record` cannot move to `to`, if it cannot.
pub(crate) fn close_conflict(record: &PurchaseRecord, to: PurchaseStatus) -> Option<StoreError> {
    if to == PurchaseStatus::Pending {
        return Some(StoreError::Conflict(format!(
            "purchase {} cannot be closed as pending",
            record.escrow_id
        )));
    }
    (record.status != PurchaseStatus::Pending)
        .then(|| StoreError::Conflict(format!("purchase {} is no longer pending", record.escrow_id)))
}

/// Where the escrow state machine keeps its records. Writers are
/// serialized per escrow id by the machine; implementations only need
/// plain get / put.
pub trait EscrowStore: Send + Sync {
    fn get_escrow(&self, escrow_id: &str) -> StoreResult<Option<EscrowState>>;

    fn put_escrow(&self, escrow: &EscrowState) -> StoreResult<()>;

    fn list_escrows(&self) -> StoreResult<Vec<EscrowState>>;
}
