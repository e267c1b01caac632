//! Model and purchase records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::layers::LayerRecord;

/// A sealed model whose register transaction has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingModel {
    /// Local UUID v4.
    pub id: String,
    /// Content id of the sealed payload in the blob store.
    pub cid: String,
    /// Layer records needed to unseal, outermost last. Never holds a key.
    pub manifest: Vec<LayerRecord>,
    /// Hex SHA-256 of the symmetric key.
    pub key_hash: String,
    pub name: String,
    pub description: String,
    pub license: String,
    pub price: u64,
    pub publisher: String,
    pub register_txn_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A model the registry program has assigned an id to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedModel {
    /// Chain-assigned id (`ModelID:` log).
    pub model_id: u64,
    pub pending_id: String,
    pub cid: String,
    pub manifest: Vec<LayerRecord>,
    pub key_hash: String,
    pub name: String,
    pub description: String,
    pub license: String,
    pub price: u64,
    pub publisher: String,
    pub txn_id: String,
    pub confirmed_round: u64,
    pub published_at: DateTime<Utc>,
}

impl PublishedModel {
    pub fn from_pending(pending: PendingModel, model_id: u64, txn_id: &str, round: u64) -> Self {
        Self {
            model_id,
            pending_id: pending.id,
            cid: pending.cid,
            manifest: pending.manifest,
            key_hash: pending.key_hash,
            name: pending.name,
            description: pending.description,
            license: pending.license,
            price: pending.price,
            publisher: pending.publisher,
            txn_id: txn_id.to_string(),
            confirmed_round: round,
            published_at: Utc::now(),
        }
    }
}

/// Follows the escrow behind the purchase: `pending` until the escrow
/// completes, is refunded or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Refunded,
    Failed,
}

/// A buyer's view of one purchase, keyed by escrow id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub escrow_id: String,
    pub model_id: u64,
    pub buyer: String,
    pub status: PurchaseStatus,
    pub settlement_txn_id: Option<String>,
    pub settlement_round: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PurchaseRecord {
    pub fn pending(escrow_id: &str, model_id: u64, buyer: &str) -> Self {
        Self {
            escrow_id: escrow_id.to_string(),
            model_id,
            buyer: buyer.to_string(),
            status: PurchaseStatus::Pending,
            settlement_txn_id: None,
            settlement_round: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The closed form of this record. Callers check the status first.
    pub(crate) fn closed(mut self, status: PurchaseStatus, settlement: Option<(&str, u64)>) -> Self {
        self.status = status;
        if let Some((txn_id, round)) = settlement {
            self.settlement_txn_id = Some(txn_id.to_string());
            self.settlement_round = Some(round);
        }
        if status == PurchaseStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self
    }
}
