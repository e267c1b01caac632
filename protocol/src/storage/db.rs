//! # MarketDb: Persistent Storage Engine
//!
//! The sled-backed implementation of every storage trait in the crate.
//! One `Db`, one named tree per record family:
//!
//! | Tree               | Key                     | Value                     |
//! |--------------------|-------------------------|---------------------------|
//! | `blobs`            | content id (UTF-8)      | raw sealed bytes          |
//! | `pending_models`   | pending id (UTF-8)      | `bincode(PendingModel)`   |
//! | `published_models` | `model_id` (8B BE)      | `bincode(PublishedModel)` |
//! | `purchases`        | escrow id (UTF-8)       | `bincode(PurchaseRecord)` |
//! | `escrows`          | escrow id (UTF-8)       | `bincode(EscrowState)`    |
//!
//! Model ids are big-endian so a scan over `published_models` comes back in
//! numeric order.
//!
//! ## Atomicity
//!
//! Promotion runs as a sled transaction over both model trees: the pending
//! record disappears in the same step the published one appears. Purchase
//! completion is a read-check-write transaction on `purchases`. sled may
//! rerun a transaction closure on conflict, so closures only touch their
//! transactional trees.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{abort, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;

use super::{
    close_conflict, content_id, BlobStore, EscrowStore, PendingModel, PublishedModel, PurchaseRecord, PurchaseStatus, RecordStore,
    StoreError, StoreResult,
};
use crate::escrow::EscrowState;

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Sled(e),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Persistent marketplace storage. Cheap to clone; clones share the same
/// sled handle.
#[derive(Debug, Clone)]
pub struct MarketDb {
    db: Db,
    blobs: Tree,
    pending: Tree,
    published: Tree,
    purchases: Tree,
    escrows: Tree,
}

impl MarketDb {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database, removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            blobs: db.open_tree("blobs")?,
            pending: db.open_tree("pending_models")?,
            published: db.open_tree("published_models")?,
            purchases: db.open_tree("purchases")?,
            escrows: db.open_tree("escrows")?,
            db,
        })
    }

    fn get_decoded<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> StoreResult<Option<T>> {
        tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    fn scan_decoded<T: DeserializeOwned>(tree: &Tree) -> StoreResult<Vec<T>> {
        tree.iter()
            .values()
            .map(|v| decode(&v?))
            .collect()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn escrow_count(&self) -> usize {
        self.escrows.len()
    }

    /// Block until every pending write is durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// -- Blobs ------------------------------------------------------------------

#[async_trait]
impl BlobStore for MarketDb {
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<String> {
        let cid = content_id(&bytes);
        if !self.blobs.contains_key(cid.as_bytes())? {
            self.blobs.insert(cid.as_bytes(), bytes)?;
        }
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> StoreResult<Vec<u8>> {
        self.blobs
            .get(cid.as_bytes())?
            .map(|v| v.to_vec())
            .ok_or_else(|| StoreError::NotFound(format!("blob {cid}")))
    }

    async fn exists(&self, cid: &str) -> StoreResult<bool> {
        Ok(self.blobs.contains_key(cid.as_bytes())?)
    }
}

// -- Records ----------------------------------------------------------------

impl RecordStore for MarketDb {
    fn put_pending(&self, model: &PendingModel) -> StoreResult<()> {
        self.pending.insert(model.id.as_bytes(), encode(model)?)?;
        Ok(())
    }

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingModel>> {
        Self::get_decoded(&self.pending, id.as_bytes())
    }

    fn promote(&self, pending_id: &str, published: &PublishedModel) -> StoreResult<()> {
        let model_key = published.model_id.to_be_bytes();
        let value = encode(published)?;

        (&self.pending, &self.published).transaction(|(pending, models)| {
            if pending.get(pending_id.as_bytes())?.is_none() {
                return abort(StoreError::NotFound(format!("pending model {pending_id}")));
            }
            if models.get(&model_key[..])?.is_some() {
                return abort(StoreError::Conflict(format!(
                    "model {} already published",
                    published.model_id
                )));
            }
            pending.remove(pending_id.as_bytes())?;
            models.insert(&model_key[..], value.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    fn get_published(&self, model_id: u64) -> StoreResult<Option<PublishedModel>> {
        Self::get_decoded(&self.published, &model_id.to_be_bytes())
    }

    fn list_published(&self) -> StoreResult<Vec<PublishedModel>> {
        Self::scan_decoded(&self.published)
    }

    fn put_purchase(&self, purchase: &PurchaseRecord) -> StoreResult<()> {
        self.purchases
            .insert(purchase.escrow_id.as_bytes(), encode(purchase)?)?;
        Ok(())
    }

    fn get_purchase(&self, escrow_id: &str) -> StoreResult<Option<PurchaseRecord>> {
        Self::get_decoded(&self.purchases, escrow_id.as_bytes())
    }

    fn close_purchase(
        &self,
        escrow_id: &str,
        status: PurchaseStatus,
        settlement: Option<(&str, u64)>,
    ) -> StoreResult<PurchaseRecord> {
        let key = escrow_id.as_bytes();
        let done = self.purchases.transaction(|tx| {
            let Some(raw) = tx.get(key)? else {
                return abort(StoreError::NotFound(format!("purchase {escrow_id}")));
            };
            let record: PurchaseRecord = match decode(&raw) {
                Ok(r) => r,
                Err(e) => return abort(e),
            };
            if let Some(conflict) = close_conflict(&record, status) {
                return abort(conflict);
            }
            let done = record.closed(status, settlement);
            let bytes = match encode(&done) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            tx.insert(key, bytes)?;
            Ok(done)
        })?;
        Ok(done)
    }
}

// -- Escrows ----------------------------------------------------------------

impl EscrowStore for MarketDb {
    fn get_escrow(&self, escrow_id: &str) -> StoreResult<Option<EscrowState>> {
        Self::get_decoded(&self.escrows, escrow_id.as_bytes())
    }

    fn put_escrow(&self, escrow: &EscrowState) -> StoreResult<()> {
        self.escrows.insert(escrow.escrow_id.as_bytes(), encode(escrow)?)?;
        Ok(())
    }

    fn list_escrows(&self) -> StoreResult<Vec<EscrowState>> {
        let mut all: Vec<EscrowState> = Self::scan_decoded(&self.escrows)?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.escrow_id.cmp(&b.escrow_id)));
        Ok(all)
    }
}
