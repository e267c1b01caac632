//! In-memory adapters.
//!
//! `MemoryRecordStore` keeps all of its maps behind one mutex so promotion
//! and completion are atomic with respect to every other call. The blob
//! and escrow stores are plain concurrent maps.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    close_conflict, content_id, BlobStore, EscrowStore, PendingModel, PublishedModel, PurchaseRecord, PurchaseStatus, RecordStore,
    StoreError, StoreResult,
};
use crate::escrow::EscrowState;

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> StoreResult<String> {
        let cid = content_id(&bytes);
        self.blobs.entry(cid.clone()).or_insert(bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> StoreResult<Vec<u8>> {
        self.blobs
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("blob {cid}")))
    }

    async fn exists(&self, cid: &str) -> StoreResult<bool> {
        Ok(self.blobs.contains_key(cid))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Records {
    pending: HashMap<String, PendingModel>,
    published: HashMap<u64, PublishedModel>,
    purchases: HashMap<String, PurchaseRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Records>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put_pending(&self, model: &PendingModel) -> StoreResult<()> {
        self.inner.lock().pending.insert(model.id.clone(), model.clone());
        Ok(())
    }

    fn get_pending(&self, id: &str) -> StoreResult<Option<PendingModel>> {
        Ok(self.inner.lock().pending.get(id).cloned())
    }

    fn promote(&self, pending_id: &str, published: &PublishedModel) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.pending.contains_key(pending_id) {
            return Err(StoreError::NotFound(format!("pending model {pending_id}")));
        }
        if inner.published.contains_key(&published.model_id) {
            return Err(StoreError::Conflict(format!(
                "model {} already published",
                published.model_id
            )));
        }
        inner.pending.remove(pending_id);
        inner.published.insert(published.model_id, published.clone());
        Ok(())
    }

    fn get_published(&self, model_id: u64) -> StoreResult<Option<PublishedModel>> {
        Ok(self.inner.lock().published.get(&model_id).cloned())
    }

    fn list_published(&self) -> StoreResult<Vec<PublishedModel>> {
        let mut models: Vec<_> = self.inner.lock().published.values().cloned().collect();
        models.sort_by_key(|m| m.model_id);
        Ok(models)
    }

    fn put_purchase(&self, purchase: &PurchaseRecord) -> StoreResult<()> {
        self.inner
            .lock()
            .purchases
            .insert(purchase.escrow_id.clone(), purchase.clone());
        Ok(())
    }

    fn get_purchase(&self, escrow_id: &str) -> StoreResult<Option<PurchaseRecord>> {
        Ok(self.inner.lock().purchases.get(escrow_id).cloned())
    }

    fn close_purchase(
        &self,
        escrow_id: &str,
        status: PurchaseStatus,
        settlement: Option<(&str, u64)>,
    ) -> StoreResult<PurchaseRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .purchases
            .get_mut(escrow_id)
            .ok_or_else(|| StoreError::NotFound(format!("purchase {escrow_id}")))?;
        if let Some(conflict) = close_conflict(record, status) {
            return Err(conflict);
        }
        *record = record.clone().closed(status, settlement);
        Ok(record.clone())
    }
}

// ---------------------------------------------------------------------------
// Escrows
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryEscrowStore {
    escrows: DashMap<String, EscrowState>,
}

impl MemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EscrowStore for MemoryEscrowStore {
    fn get_escrow(&self, escrow_id: &str) -> StoreResult<Option<EscrowState>> {
        Ok(self.escrows.get(escrow_id).map(|e| e.value().clone()))
    }

    fn put_escrow(&self, escrow: &EscrowState) -> StoreResult<()> {
        self.escrows.insert(escrow.escrow_id.clone(), escrow.clone());
        Ok(())
    }

    fn list_escrows(&self) -> StoreResult<Vec<EscrowState>> {
        let mut all: Vec<_> = self.escrows.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.escrow_id.cmp(&b.escrow_id)));
        Ok(all)
    }
}
