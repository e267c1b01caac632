//! The marketplace facade.
//!
//! One object that owns the publish flow, the escrow state machine and
//! the stores they share, and adds the buyer's side: purchase records and
//! download. Purchase records follow their escrow into whichever terminal
//! state it reaches.
//!
//! A download yields the artifact exactly as the publisher's watermark
//! left it. The watermark layer is not undone; that is the point of it.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::names::NameService;
use super::publish::PublishFlow;
use super::MarketError;
use crate::config::MarketConfig;
use crate::crypto::keys::EncryptionKey;
use crate::crypto::layers::{unseal_through, LayerRecord, LayeredEnvelope, UnsealKeys};
use crate::escrow::{EscrowError, EscrowListener, EscrowState, EscrowStateMachine, EscrowStatus, PurchaseRequest};
use crate::ledger::LedgerGateway;
use crate::storage::{
    BlobStore, EscrowStore, PublishedModel, PurchaseRecord, PurchaseStatus, RecordStore, StoreError,
};
use crate::transaction::{
    ProtocolError, SignedSubmission, TransactionProtocol, TransactionSigner, UnsignedTransactionDescriptor,
};

/// A purchase waiting for the buyer's signature.
#[derive(Debug, Clone)]
pub struct PreparedPurchase {
    pub request: PurchaseRequest,
    pub descriptor: UnsignedTransactionDescriptor,
}

/// Closes purchase records as their escrows close.
struct PurchaseBook {
    records: Arc<dyn RecordStore>,
}

impl EscrowListener for PurchaseBook {
    fn escrow_closed(&self, state: &EscrowState) {
        let status = match state.status {
            EscrowStatus::Completed => PurchaseStatus::Completed,
            EscrowStatus::Refunded => PurchaseStatus::Refunded,
            EscrowStatus::Failed => PurchaseStatus::Failed,
            EscrowStatus::Pending => return,
        };
        let settlement = state.settlement_txn_id.as_deref().zip(state.settlement_round);
        match self.records.close_purchase(&state.escrow_id, status, settlement) {
            Ok(record) => info!(
                escrow_id = %state.escrow_id,
                model_id = record.model_id,
                status = ?status,
                "purchase closed"
            ),
            Err(StoreError::NotFound(_)) => debug!(escrow_id = %state.escrow_id, "escrow has no purchase record"),
            Err(e) => warn!(escrow_id = %state.escrow_id, error = %e, "could not close purchase record"),
        }
    }
}

pub struct Marketplace {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    protocol: Arc<TransactionProtocol>,
    publish: PublishFlow,
    escrow: Arc<EscrowStateMachine>,
    names: NameService,
    config: MarketConfig,
}

impl Marketplace {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        escrows: Arc<dyn EscrowStore>,
        gateway: Arc<dyn LedgerGateway>,
        config: MarketConfig,
    ) -> Self {
        let protocol = Arc::new(TransactionProtocol::new(gateway, config.protocol.clone()));
        let publish = PublishFlow::new(blobs.clone(), records.clone(), protocol.clone(), config.kdf);
        let book = Arc::new(PurchaseBook {
            records: records.clone(),
        });
        let escrow = Arc::new(
            EscrowStateMachine::new(escrows, protocol.clone(), config.escrow.clone()).with_listener(book),
        );
        let names = NameService::new(protocol.clone());
        Self {
            blobs,
            records,
            protocol,
            publish,
            escrow,
            names,
            config,
        }
    }

    pub fn publisher(&self) -> &PublishFlow {
        &self.publish
    }

    pub fn escrow(&self) -> &Arc<EscrowStateMachine> {
        &self.escrow
    }

    pub fn names(&self) -> &NameService {
        &self.names
    }

    pub fn protocol(&self) -> &Arc<TransactionProtocol> {
        &self.protocol
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    // -- Catalogue ----------------------------------------------------------

    pub fn get_model(&self, model_id: u64) -> Result<PublishedModel, MarketError> {
        self.records
            .get_published(model_id)?
            .ok_or_else(|| MarketError::NotFound(format!("model {model_id}")))
    }

    pub fn list_models(&self) -> Result<Vec<PublishedModel>, MarketError> {
        Ok(self.records.list_published()?)
    }

    pub fn get_purchase(&self, escrow_id: &str) -> Result<Option<PurchaseRecord>, MarketError> {
        Ok(self.records.get_purchase(escrow_id)?)
    }

    // -- Buying -------------------------------------------------------------

    /// What buying `model_id` as `buyer` costs and creates, straight from
    /// the catalogue.
    fn purchase_request(&self, model_id: u64, buyer: &str) -> Result<PurchaseRequest, MarketError> {
        let model = self.get_model(model_id)?;
        if model.publisher == buyer {
            return Err(MarketError::Validation("publishers can't buy their own model".into()));
        }
        Ok(PurchaseRequest {
            model_id,
            buyer: buyer.to_string(),
            publisher: model.publisher,
            price: model.price,
            encryption_key_hash: Some(model.key_hash),
        })
    }

    /// Purchase group for `buyer` to sign, priced from the catalogue.
    pub async fn prepare_purchase(&self, model_id: u64, buyer: &str) -> Result<PreparedPurchase, MarketError> {
        let request = self.purchase_request(model_id, buyer)?;
        let descriptor = self.escrow.prepare_purchase(&request).await?;
        Ok(PreparedPurchase { request, descriptor })
    }

    /// Submit the buyer-signed purchase, open the escrow, and record the
    /// purchase as pending. The signed group is checked against the
    /// catalogue's current price and publisher, not anything the caller
    /// claims.
    pub async fn open_purchase(
        &self,
        model_id: u64,
        buyer: &str,
        signed: &SignedSubmission,
    ) -> Result<EscrowState, MarketError> {
        let request = self.purchase_request(model_id, buyer)?;
        let state = self.escrow.open_escrow(&request, signed).await?;
        self.records
            .put_purchase(&PurchaseRecord::pending(&state.escrow_id, state.model_id, &state.buyer))?;
        Ok(state)
    }

    /// Prepare, sign with `buyer` and open. Returns the escrow id.
    pub async fn purchase(&self, model_id: u64, buyer: &dyn TransactionSigner) -> Result<String, MarketError> {
        let prepared = self.prepare_purchase(model_id, &buyer.address()).await?;
        let signed = buyer
            .sign(&prepared.descriptor)
            .await
            .map_err(ProtocolError::from)?;
        Ok(self
            .open_purchase(model_id, &prepared.request.buyer, &signed)
            .await?
            .escrow_id)
    }

    /// Wait for the payment, release it with the publisher's signature,
    /// and complete the purchase record.
    ///
    /// If the payment never confirms the escrow ends `failed`, so does the
    /// purchase record, and this returns `StateConflict`.
    pub async fn complete_purchase(
        &self,
        escrow_id: &str,
        key: &EncryptionKey,
        publisher: &dyn TransactionSigner,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<PurchaseRecord, MarketError> {
        let state = self
            .escrow
            .monitor_escrow(escrow_id, Some(key), Some(publisher), cancel)
            .await?;
        if state.status != EscrowStatus::Completed {
            return Err(EscrowError::StateConflict {
                escrow_id: state.escrow_id,
                status: state.status,
            }
            .into());
        }
        self.record_completion(&state)
    }

    /// The purchase record for a completed escrow, closing it if the
    /// escrow listener has not already.
    pub fn record_completion(&self, state: &EscrowState) -> Result<PurchaseRecord, MarketError> {
        let (Some(txn_id), Some(round)) = (state.settlement_txn_id.as_deref(), state.settlement_round) else {
            return Err(MarketError::Validation(format!(
                "escrow {} has no confirmed settlement",
                state.escrow_id
            )));
        };
        if let Some(existing) = self.records.get_purchase(&state.escrow_id)? {
            if existing.settlement_txn_id.as_deref() == Some(txn_id) {
                return Ok(existing);
            }
        }
        let record = self.records.complete_purchase(&state.escrow_id, txn_id, round)?;
        info!(escrow_id = %state.escrow_id, model_id = record.model_id, round, "purchase completed");
        Ok(record)
    }

    /// Fetch and unseal the model bought through `escrow_id`.
    ///
    /// The escrow must be completed and `key_hex` must hash to its key
    /// hash. The returned bytes still carry the publisher's watermark.
    pub async fn download(&self, escrow_id: &str, key_hex: &str) -> Result<Vec<u8>, MarketError> {
        let state = self
            .escrow
            .get_escrow(escrow_id)?
            .ok_or_else(|| MarketError::NotFound(format!("escrow {escrow_id}")))?;
        if state.status != EscrowStatus::Completed {
            return Err(EscrowError::StateConflict {
                escrow_id: state.escrow_id,
                status: state.status,
            }
            .into());
        }
        if !self.escrow.verify_encryption_key(escrow_id, key_hex)? {
            return Err(MarketError::Validation("key does not match this purchase".into()));
        }

        let model = self.get_model(state.model_id)?;
        let envelope = LayeredEnvelope {
            payload: self.blobs.get(&model.cid).await?,
            layers: model.manifest,
        };
        let keep_watermark = matches!(envelope.layers.first(), Some(LayerRecord::Watermark { .. }));
        let count = envelope.layers.len() - usize::from(keep_watermark);

        let passphrase = Zeroizing::new(key_hex.to_ascii_lowercase());
        let data = tokio::task::spawn_blocking(move || {
            let keys = UnsealKeys {
                passphrase: Some(passphrase.as_bytes()),
                recipient: None,
            };
            unseal_through(&envelope, count, &keys)
        })
        .await
        .map_err(|e| MarketError::Internal(format!("unsealing task failed: {e}")))??;

        info!(escrow_id, model_id = state.model_id, bytes = data.len(), "model downloaded");
        Ok(data)
    }
}
