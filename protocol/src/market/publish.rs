//! Publishing: seal an artifact, store it, register it on the ledger.
//!
//! The symmetric key is generated here and handed back to the caller
//! exactly once, inside [`PreparedPublish`]. Only its hash is persisted.
//! The hex form of the key is the passphrase for the symmetric layer, so
//! whoever holds the key can run the envelope KDF themselves.
//!
//! Once a register transaction has been accepted its id is kept on the
//! pending record. A confirmation that times out is finished with
//! [`PublishFlow::resume_publish`], never by submitting again.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::PublishError;
use crate::config::{KdfParams, LOG_PREFIX_MODEL_ID};
use crate::crypto::keys::EncryptionKey;
use crate::crypto::layers::{EncryptionPlan, LayerRecord};
use crate::storage::{BlobStore, PendingModel, PublishedModel, RecordStore, StoreError};
use crate::transaction::{
    extract_u64, ConfirmationResult, PrepareRequest, ProtocolError, SignedSubmission, TransactionProtocol,
    TransactionSigner, UnsignedTransactionDescriptor,
};
use crate::watermark::WatermarkPosition;

/// What a publisher hands in.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub name: String,
    pub description: String,
    pub license: String,
    pub price: u64,
    pub publisher: String,
    pub data: Vec<u8>,
    /// Owner string for the watermark layer. `None` skips the layer.
    pub watermark_owner: Option<String>,
    pub watermark_position: WatermarkPosition,
}

/// A sealed, stored, not-yet-registered model.
///
/// `key` is the only copy of the symmetric key the marketplace will ever
/// produce. Lose it and the model can't be released to anyone.
pub struct PreparedPublish {
    pub pending_id: String,
    pub cid: String,
    pub key: EncryptionKey,
    pub key_hash: String,
    /// Register transaction for the publisher to sign.
    pub descriptor: UnsignedTransactionDescriptor,
    /// The watermark string, if a watermark layer was applied.
    pub watermark: Option<String>,
}

pub struct PublishFlow {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    protocol: Arc<TransactionProtocol>,
    kdf: KdfParams,
}

impl PublishFlow {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        protocol: Arc<TransactionProtocol>,
        kdf: KdfParams,
    ) -> Self {
        Self {
            blobs,
            records,
            protocol,
            kdf,
        }
    }

    /// Seal, store, record as pending, and build the register transaction.
    pub async fn prepare_publish(&self, request: PublishRequest) -> Result<PreparedPublish, PublishError> {
        validate(&request)?;

        let key = EncryptionKey::generate();
        let key_hash = key.hash();
        let passphrase = Zeroizing::new(key.to_hex());

        let mut plan = EncryptionPlan::new().with_symmetric(self.kdf);
        if let Some(owner) = &request.watermark_owner {
            plan = plan.with_watermark(owner.clone(), request.watermark_position);
        }

        // KDF + AES over a whole model is CPU work; keep it off the runtime.
        let data = request.data;
        let envelope = tokio::task::spawn_blocking(move || plan.seal(&data, Some(passphrase.as_bytes())))
            .await
            .map_err(|e| PublishError::Internal(format!("sealing task failed: {e}")))??;

        let watermark = envelope.watermark().and_then(|record| match record {
            LayerRecord::Watermark { watermark, .. } => Some(watermark.clone()),
            _ => None,
        });
        let sealed_len = envelope.payload.len();
        let cid = self.blobs.put(envelope.payload).await?;

        let descriptor = self
            .protocol
            .prepare(PrepareRequest::Register {
                publisher: request.publisher.clone(),
                cid: cid.clone(),
                license: request.license.clone(),
            })
            .await?;

        let pending = PendingModel {
            id: Uuid::new_v4().to_string(),
            cid: cid.clone(),
            manifest: envelope.layers,
            key_hash: key_hash.clone(),
            name: request.name,
            description: request.description,
            license: request.license,
            price: request.price,
            publisher: request.publisher,
            register_txn_id: None,
            created_at: Utc::now(),
        };
        self.records.put_pending(&pending)?;

        info!(
            pending_id = %pending.id,
            cid = %cid,
            sealed_len,
            layers = pending.manifest.len(),
            "model sealed and stored"
        );

        Ok(PreparedPublish {
            pending_id: pending.id,
            cid,
            key,
            key_hash,
            descriptor,
            watermark,
        })
    }

    /// Submit the publisher-signed register transaction, wait for it, and
    /// promote the pending record under the chain-assigned model id.
    ///
    /// The signed transaction must register exactly this pending model's
    /// content id and license from its publisher.
    pub async fn confirm_publish(
        &self,
        pending_id: &str,
        signed: &SignedSubmission,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<PublishedModel, PublishError> {
        let mut pending = self.load_pending(pending_id)?;
        if let Some(txn_id) = pending.register_txn_id.clone() {
            return Err(PublishError::RegisterInFlight {
                pending_id: pending_id.to_string(),
                txn_id,
            });
        }

        let request = PrepareRequest::Register {
            publisher: pending.publisher.clone(),
            cid: pending.cid.clone(),
            license: pending.license.clone(),
        };
        match self.protocol.check_submission(&request, signed) {
            Ok(_) => {}
            Err(ProtocolError::Validation(reason)) => return Err(PublishError::Validation(reason)),
            Err(e) => return Err(e.into()),
        }

        let txn_id = self.protocol.submit(signed).await?;
        pending.register_txn_id = Some(txn_id.clone());
        self.records.put_pending(&pending)?;
        debug!(pending_id, txn_id = %txn_id, "register submitted");

        let result = self.protocol.confirm(&txn_id, timeout, cancel).await;
        self.finish(pending, result, timeout)
    }

    /// Poll an already submitted register transaction again.
    pub async fn resume_publish(
        &self,
        pending_id: &str,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<PublishedModel, PublishError> {
        let pending = self.load_pending(pending_id)?;
        let txn_id = pending.register_txn_id.clone().ok_or_else(|| {
            PublishError::Validation(format!("pending model {pending_id} has no register transaction in flight"))
        })?;
        info!(pending_id, txn_id = %txn_id, "resuming register confirmation");
        let result = self.protocol.confirm(&txn_id, timeout, cancel).await;
        self.finish(pending, result, timeout)
    }

    fn load_pending(&self, pending_id: &str) -> Result<PendingModel, PublishError> {
        self.records
            .get_pending(pending_id)?
            .ok_or_else(|| PublishError::NotFound(format!("pending model {pending_id}")))
    }

    /// Promote on confirmation. A pool rejection forgets the transaction
    /// so a fresh one can be signed; anything else keeps it for a resume.
    fn finish(
        &self,
        mut pending: PendingModel,
        result: ConfirmationResult,
        timeout: Duration,
    ) -> Result<PublishedModel, PublishError> {
        let confirmed = match result.into_confirmed(timeout) {
            Ok(confirmed) => confirmed,
            Err(ProtocolError::Rejected(reason)) => {
                pending.register_txn_id = None;
                self.records.put_pending(&pending)?;
                warn!(pending_id = %pending.id, reason = %reason, "register rejected");
                return Err(ProtocolError::Rejected(reason).into());
            }
            Err(e) => return Err(e.into()),
        };
        let model_id = extract_u64(&confirmed.logs, LOG_PREFIX_MODEL_ID)?;

        let pending_id = pending.id.clone();
        let published = PublishedModel::from_pending(pending, model_id, &confirmed.tx_id, confirmed.round);
        self.records.promote(&pending_id, &published)?;

        info!(
            model_id,
            cid = %published.cid,
            round = confirmed.round,
            "model published"
        );
        Ok(published)
    }

    /// Prepare, sign with `signer`, and confirm. Returns the published
    /// record and the key.
    pub async fn publish(
        &self,
        request: PublishRequest,
        signer: &dyn TransactionSigner,
        timeout: Duration,
    ) -> Result<(PublishedModel, EncryptionKey), PublishError> {
        let prepared = self.prepare_publish(request).await?;
        let signed = signer
            .sign(&prepared.descriptor)
            .await
            .map_err(ProtocolError::from)?;
        let published = self
            .confirm_publish(&prepared.pending_id, &signed, timeout, None)
            .await?;
        Ok((published, prepared.key))
    }

    pub fn get_pending(&self, pending_id: &str) -> Result<Option<PendingModel>, StoreError> {
        self.records.get_pending(pending_id)
    }
}

fn validate(request: &PublishRequest) -> Result<(), PublishError> {
    if request.data.is_empty() {
        return Err(PublishError::Validation("model data is empty".into()));
    }
    if request.name.trim().is_empty() {
        return Err(PublishError::Validation("model name is empty".into()));
    }
    if request.price == 0 {
        return Err(PublishError::Validation("price must be positive".into()));
    }
    if let Some(owner) = &request.watermark_owner {
        if owner.is_empty() {
            return Err(PublishError::Validation("watermark owner is empty".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::crypto::keys::AccountKeypair;
    use crate::crypto::layers::{unseal, LayeredEnvelope, UnsealKeys};
    use crate::ledger::{AccountInfo, GatewayError, LedgerGateway, NetworkParams, PendingInfo};
    use crate::storage::{MemoryBlobStore, MemoryRecordStore};
    use crate::transaction::{decode_frames, itob, KeypairSigner, SignedTransaction};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    const FAST: KdfParams = KdfParams::Pbkdf2Sha512 { iterations: 1_000 };

    /// Confirms everything at round 100 and numbers registrations.
    #[derive(Default)]
    struct Registry {
        count: AtomicU64,
        stall: AtomicBool,
        logs: dashmap::DashMap<String, Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl LedgerGateway for Registry {
        async fn get_params(&self) -> Result<NetworkParams, GatewayError> {
            Ok(NetworkParams {
                fee: 1_000,
                min_fee: 1_000,
                last_round: 99,
                genesis_id: "stub".into(),
            })
        }

        async fn submit_raw(&self, raw: &[u8]) -> Result<String, GatewayError> {
            let frames = decode_frames(raw).map_err(|e| GatewayError::Rejected(e.to_string()))?;
            let tx = SignedTransaction::from_bytes(&frames[0]).map_err(|e| GatewayError::Rejected(e.to_string()))?;
            let id = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            let mut line = LOG_PREFIX_MODEL_ID.as_bytes().to_vec();
            line.extend_from_slice(&itob(id));
            self.logs.insert(tx.id().to_string(), vec![line]);
            Ok(tx.id().to_string())
        }

        async fn pending_info(&self, tx_id: &str) -> Result<PendingInfo, GatewayError> {
            if self.stall.load(Ordering::SeqCst) {
                return Ok(PendingInfo::default());
            }
            Ok(PendingInfo {
                confirmed_round: Some(100),
                pool_error: None,
                logs: self.logs.get(tx_id).map(|l| l.clone()).unwrap_or_default(),
            })
        }

        async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo {
                address: address.into(),
                balance: 1_000_000,
                min_balance: 0,
            })
        }
    }

    fn flow() -> (PublishFlow, Arc<MemoryBlobStore>, Arc<MemoryRecordStore>) {
        let (flow, blobs, records, _) = flow_with_registry();
        (flow, blobs, records)
    }

    fn flow_with_registry() -> (PublishFlow, Arc<MemoryBlobStore>, Arc<MemoryRecordStore>, Arc<Registry>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let registry = Arc::new(Registry::default());
        let protocol = Arc::new(TransactionProtocol::new(
            registry.clone(),
            ProtocolConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        (
            PublishFlow::new(blobs.clone(), records.clone(), protocol, FAST),
            blobs,
            records,
            registry,
        )
    }

    fn request(publisher: &str) -> PublishRequest {
        PublishRequest {
            name: "protein-folder".into(),
            description: "folds proteins".into(),
            license: "CC-BY-4.0".into(),
            price: 5_000,
            publisher: publisher.into(),
            data: vec![7u8; 1000],
            watermark_owner: Some("alice".into()),
            watermark_position: WatermarkPosition::Start,
        }
    }

    #[tokio::test]
    async fn prepare_stores_sealed_blob_and_pending_record() {
        let (flow, blobs, records) = flow();
        let publisher = AccountKeypair::generate().address();
        let prepared = flow.prepare_publish(request(&publisher)).await.unwrap();

        assert_eq!(prepared.key.hash(), prepared.key_hash);
        assert_eq!(prepared.watermark.as_deref().map(str::len), Some(64));
        assert_eq!(blobs.len(), 1);

        let pending = records.get_pending(&prepared.pending_id).unwrap().unwrap();
        assert_eq!(pending.key_hash, prepared.key_hash);
        assert_eq!(pending.manifest.len(), 2);
        assert!(pending.register_txn_id.is_none());

        // The key hex is the passphrase; the stored blob unseals with it.
        let envelope = LayeredEnvelope {
            payload: blobs.get(&prepared.cid).await.unwrap(),
            layers: pending.manifest,
        };
        let passphrase = prepared.key.to_hex();
        let keys = UnsealKeys {
            passphrase: Some(passphrase.as_bytes()),
            recipient: None,
        };
        assert_eq!(unseal(&envelope, &keys).unwrap(), vec![7u8; 1000]);
    }

    #[tokio::test]
    async fn publish_promotes_under_chain_model_id() {
        let (flow, _, records) = flow();
        let signer = KeypairSigner::new(AccountKeypair::generate());

        let (first, key) = flow
            .publish(request(&signer.address()), &signer, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.model_id, 1);
        assert_eq!(first.confirmed_round, 100);
        assert_eq!(first.key_hash, key.hash());
        assert!(records.get_pending(&first.pending_id).unwrap().is_none());

        let (second, _) = flow
            .publish(request(&signer.address()), &signer, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.model_id, 2);
        assert_eq!(records.list_published().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn confirm_refuses_someone_elses_signature() {
        let (flow, _, records) = flow();
        let publisher = KeypairSigner::new(AccountKeypair::generate());
        let prepared = flow.prepare_publish(request(&publisher.address())).await.unwrap();

        let mallory = KeypairSigner::new(AccountKeypair::generate());
        let mut forged = prepared.descriptor.clone();
        for tx in &mut forged.transactions {
            tx.sender = mallory.address();
        }
        let signed = mallory.sign(&forged).await.unwrap();
        let err = flow
            .confirm_publish(&prepared.pending_id, &signed, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
        assert!(records.get_pending(&prepared.pending_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn register_for_another_cid_is_refused() {
        let (flow, _, records) = flow();
        let publisher = KeypairSigner::new(AccountKeypair::generate());
        let prepared = flow.prepare_publish(request(&publisher.address())).await.unwrap();

        let mut other = request(&publisher.address());
        other.data = vec![9u8; 1000];
        let elsewhere = flow.prepare_publish(other).await.unwrap();
        let signed = publisher.sign(&elsewhere.descriptor).await.unwrap();

        let err = flow
            .confirm_publish(&prepared.pending_id, &signed, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
        let pending = records.get_pending(&prepared.pending_id).unwrap().unwrap();
        assert!(pending.register_txn_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_register_is_resumed() {
        let (flow, _, records, registry) = flow_with_registry();
        let publisher = KeypairSigner::new(AccountKeypair::generate());
        let prepared = flow.prepare_publish(request(&publisher.address())).await.unwrap();
        let signed = publisher.sign(&prepared.descriptor).await.unwrap();

        registry.stall.store(true, Ordering::SeqCst);
        let err = flow
            .confirm_publish(&prepared.pending_id, &signed, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Protocol(ProtocolError::ConfirmationTimeout { .. })
        ));
        let txn_id = records
            .get_pending(&prepared.pending_id)
            .unwrap()
            .unwrap()
            .register_txn_id
            .unwrap();

        registry.stall.store(false, Ordering::SeqCst);
        assert!(matches!(
            flow.confirm_publish(&prepared.pending_id, &signed, Duration::from_secs(1), None)
                .await,
            Err(PublishError::RegisterInFlight { .. })
        ));
        assert_eq!(registry.count.load(Ordering::SeqCst), 1);

        let published = flow
            .resume_publish(&prepared.pending_id, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(published.model_id, 1);
        assert_eq!(published.txn_id, txn_id);
        assert!(records.get_pending(&prepared.pending_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected_before_sealing() {
        let (flow, blobs, _) = flow();
        let publisher = AccountKeypair::generate().address();

        let mut empty = request(&publisher);
        empty.data.clear();
        assert!(matches!(
            flow.prepare_publish(empty).await,
            Err(PublishError::Validation(_))
        ));

        let mut free = request(&publisher);
        free.price = 0;
        assert!(matches!(
            flow.prepare_publish(free).await,
            Err(PublishError::Validation(_))
        ));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn unknown_pending_id_is_not_found() {
        let (flow, _, _) = flow();
        let err = flow
            .confirm_publish("nope", &SignedSubmission::Single(vec![1]), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotFound(_)));
    }
}
