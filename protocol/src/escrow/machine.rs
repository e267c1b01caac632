//! # Escrow State Machine
//!
//! Drives an escrow from `pending` to exactly one terminal state, and
//! never back.
//!
//! ## Lifecycle
//!
//! 1. **Open**: `prepare_purchase` → buyer signs → `open_escrow`. The
//!    record is written only after the gateway accepted the purchase group.
//! 2. **Fund**: `confirm_funding` polls the purchase group. Confirmed means
//!    the chain escrow id and payment round get recorded; timeout or pool
//!    rejection means `failed`; cancellation changes nothing.
//! 3. **Settle**: `release_payment` (publisher) or `refund_payment` (buyer).
//!    The submitted transaction id is recorded before confirmation starts.
//!    The status changes only once it confirms in a concrete round. A pool
//!    rejection clears the in-flight record; a timeout or cancellation
//!    keeps it, and `resume_settlement` re-polls the same transaction.
//! 4. **Sweep**: `cleanup_old_escrows` marks stale pending escrows
//!    `failed`, leaving alone any with a settlement in flight.
//!
//! Every signed submission must match, member for member, the request the
//! record implies. Terminal transitions are reported to an optional
//! [`EscrowListener`].
//!
//! ## Concurrency
//!
//! Every mutation takes the escrow's own `tokio::sync::Mutex` and re-reads
//! the record under it, so two racing releases serialize: one completes,
//! the other sees `completed` and gets `StateConflict`. There is no lock
//! across escrows. A lock's table entry goes away when its last holder
//! releases it. Reads never lock; they return snapshot copies from the
//! store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::state::{
    EscrowFilter, EscrowState, EscrowStatistics, EscrowStatus, PurchaseRequest, ReleasedKey, SettlementInFlight,
};
use super::EscrowError;
use crate::config::{EscrowConfig, LOG_PREFIX_ESCROW_ID};
use crate::crypto::hash::domain_separated_hash_parts;
use crate::crypto::hybrid::wrap_key;
use crate::crypto::keys::EncryptionKey;
use crate::storage::EscrowStore;
use crate::transaction::{
    extract_u64, ConfirmationFailure, ConfirmationResult, PrepareRequest, ProtocolError, SignedSubmission,
    TransactionProtocol, TransactionSigner, UnsignedTransactionDescriptor,
};

const ESCROW_ID_CONTEXT: &str = "desci-market 2026 escrow id v1";

/// Escrow id: hex of a domain-separated hash over model, buyer and the
/// creation time in milliseconds.
pub fn escrow_id(model_id: u64, buyer: &str, timestamp_ms: i64) -> String {
    hex::encode(domain_separated_hash_parts(
        ESCROW_ID_CONTEXT,
        &[&model_id.to_be_bytes(), buyer.as_bytes(), &timestamp_ms.to_be_bytes()],
    ))
}

fn conflict(state: &EscrowState) -> EscrowError {
    EscrowError::StateConflict {
        escrow_id: state.escrow_id.clone(),
        status: state.status,
    }
}

fn ensure_pending(state: &EscrowState) -> Result<(), EscrowError> {
    if state.is_pending() {
        Ok(())
    } else {
        Err(conflict(state))
    }
}

fn funded_id(state: &EscrowState) -> Result<u64, EscrowError> {
    state.chain_escrow_id.ok_or_else(|| {
        EscrowError::Validation(format!("escrow {} has no confirmed payment yet", state.escrow_id))
    })
}

/// Pending, and nothing already submitted to settle it.
fn ensure_settleable(state: &EscrowState) -> Result<(), EscrowError> {
    ensure_pending(state)?;
    match (&state.settling, &state.settlement_txn_id) {
        (Some(_), Some(txn_id)) => Err(EscrowError::SettlementInFlight {
            escrow_id: state.escrow_id.clone(),
            txn_id: txn_id.clone(),
        }),
        _ => Ok(()),
    }
}

/// Told about every escrow that reaches a terminal state, after the
/// record has been written.
pub trait EscrowListener: Send + Sync {
    fn escrow_closed(&self, state: &EscrowState);
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// One escrow's lock. Dropping it releases the mutex and removes the
/// table entry if nobody else holds or waits on it.
struct EscrowGuard<'a> {
    locks: &'a LockTable,
    escrow_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EscrowGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.escrow_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct EscrowStateMachine {
    store: Arc<dyn EscrowStore>,
    protocol: Arc<TransactionProtocol>,
    config: EscrowConfig,
    locks: LockTable,
    listener: Option<Arc<dyn EscrowListener>>,
}

impl EscrowStateMachine {
    pub fn new(store: Arc<dyn EscrowStore>, protocol: Arc<TransactionProtocol>, config: EscrowConfig) -> Self {
        Self {
            store,
            protocol,
            config,
            locks: DashMap::new(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn EscrowListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn protocol(&self) -> &Arc<TransactionProtocol> {
        &self.protocol
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    async fn lock(&self, escrow_id: &str) -> EscrowGuard<'_> {
        let mutex = self.locks.entry(escrow_id.to_string()).or_default().clone();
        EscrowGuard {
            locks: &self.locks,
            escrow_id: escrow_id.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Write a terminal record and tell the listener.
    fn close(&self, state: &EscrowState) -> Result<(), EscrowError> {
        self.store.put_escrow(state)?;
        if let Some(listener) = &self.listener {
            listener.escrow_closed(state);
        }
        Ok(())
    }

    /// `signed` must be exactly what `request` prepares.
    fn check_signed(&self, request: &PrepareRequest, signed: &SignedSubmission) -> Result<(), EscrowError> {
        match self.protocol.check_submission(request, signed) {
            Ok(_) => Ok(()),
            Err(ProtocolError::Validation(reason)) => Err(EscrowError::Validation(reason)),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, escrow_id: &str) -> Result<EscrowState, EscrowError> {
        self.store
            .get_escrow(escrow_id)?
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))
    }

    // -- Opening ------------------------------------------------------------

    fn purchase_request(request: &PurchaseRequest) -> Result<PrepareRequest, EscrowError> {
        if let Some(hash) = &request.encryption_key_hash {
            if hash.len() != 64 || hex::decode(hash).is_err() {
                return Err(EscrowError::Validation("encryption key hash must be 64 hex chars".into()));
            }
        }
        Ok(PrepareRequest::Purchase {
            buyer: request.buyer.clone(),
            publisher: request.publisher.clone(),
            model_id: request.model_id,
            price: request.price,
        })
    }

    /// Grouped payment + escrow creation for the buyer to sign.
    pub async fn prepare_purchase(&self, request: &PurchaseRequest) -> Result<UnsignedTransactionDescriptor, EscrowError> {
        let descriptor = self.protocol.prepare(Self::purchase_request(request)?).await?;
        self.protocol.ensure_spendable(&request.buyer, request.price).await?;
        Ok(descriptor)
    }

    /// Submit the buyer-signed purchase group and record a pending escrow.
    /// The group must pay exactly `request.price` to the escrow account and
    /// create exactly this escrow.
    pub async fn open_escrow(
        &self,
        request: &PurchaseRequest,
        signed: &SignedSubmission,
    ) -> Result<EscrowState, EscrowError> {
        self.check_signed(&Self::purchase_request(request)?, signed)?;
        let txn_id = self.protocol.submit(signed).await?;

        let now = Utc::now();
        let mut timestamp_ms = now.timestamp_millis();
        // Same buyer and model within one millisecond: step the timestamp.
        let (id, _guard) = loop {
            let id = escrow_id(request.model_id, &request.buyer, timestamp_ms);
            let guard = self.lock(&id).await;
            if self.store.get_escrow(&id)?.is_none() {
                break (id, guard);
            }
            timestamp_ms += 1;
        };

        let state = EscrowState {
            escrow_id: id,
            model_id: request.model_id,
            buyer: request.buyer.clone(),
            publisher: request.publisher.clone(),
            price: request.price,
            status: EscrowStatus::Pending,
            txn_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            encryption_key: None,
            encryption_key_hash: request.encryption_key_hash.clone(),
            chain_escrow_id: None,
            payment_round: None,
            settlement_txn_id: None,
            settlement_round: None,
            failure_reason: None,
            settling: None,
        };
        self.store.put_escrow(&state)?;

        info!(
            escrow_id = %state.escrow_id,
            model_id = state.model_id,
            price = state.price,
            txn_id = %state.txn_id,
            "escrow opened"
        );
        Ok(state)
    }

    /// Prepare, sign and open in one call. Returns the escrow id.
    pub async fn create_escrow(
        &self,
        request: PurchaseRequest,
        signer: &dyn TransactionSigner,
    ) -> Result<String, EscrowError> {
        let descriptor = self.prepare_purchase(&request).await?;
        let signed = signer.sign(&descriptor).await.map_err(ProtocolError::from)?;
        Ok(self.open_escrow(&request, &signed).await?.escrow_id)
    }

    // -- Funding ------------------------------------------------------------

    /// Wait for the purchase group to confirm.
    ///
    /// Returns the updated record: funded and still pending, or `failed`
    /// after a timeout or rejection. Cancellation is an error and leaves
    /// the escrow as it was.
    pub async fn confirm_funding(
        &self,
        escrow_id: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<EscrowState, EscrowError> {
        let snapshot = self.load(escrow_id)?;
        ensure_pending(&snapshot)?;
        if snapshot.is_funded() {
            return Ok(snapshot);
        }

        let result = self
            .protocol
            .confirm(&snapshot.txn_id, self.config.monitor_timeout, cancel)
            .await;

        let _guard = self.lock(escrow_id).await;
        let mut state = self.load(escrow_id)?;
        ensure_pending(&state)?;
        if state.is_funded() {
            return Ok(state);
        }

        let now = Utc::now();
        match (&result.error, result.confirmed, result.round) {
            (_, true, Some(round)) => {
                let chain_id = extract_u64(&result.logs, LOG_PREFIX_ESCROW_ID)?;
                state.chain_escrow_id = Some(chain_id);
                state.payment_round = Some(round);
                state.updated_at = now;
                self.store.put_escrow(&state)?;
                info!(escrow_id, chain_escrow_id = chain_id, round, "escrow funded");
                Ok(state)
            }
            (Some(ConfirmationFailure::Cancelled), _, _) => Err(ProtocolError::Cancelled.into()),
            (error, _, _) => {
                let reason = match error {
                    Some(ConfirmationFailure::Rejected(r)) => format!("payment rejected: {r}"),
                    _ => format!(
                        "payment not confirmed within {}s",
                        self.config.monitor_timeout.as_secs()
                    ),
                };
                state.status = EscrowStatus::Failed;
                state.failure_reason = Some(reason.clone());
                state.updated_at = now;
                self.close(&state)?;
                warn!(escrow_id, reason = %reason, "escrow failed");
                Ok(state)
            }
        }
    }

    /// Confirm funding, then release with `signer` if one is given.
    pub async fn monitor_escrow(
        &self,
        escrow_id: &str,
        key: Option<&EncryptionKey>,
        signer: Option<&dyn TransactionSigner>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<EscrowState, EscrowError> {
        let state = self.confirm_funding(escrow_id, cancel.clone()).await?;
        let Some(signer) = signer else {
            return Ok(state);
        };
        if !state.is_pending() {
            return Ok(state);
        }
        let descriptor = self.prepare_release(escrow_id).await?;
        let signed = signer.sign(&descriptor).await.map_err(ProtocolError::from)?;
        self.settle(escrow_id, EscrowStatus::Completed, key, &signed, cancel).await
    }

    // -- Settlement ---------------------------------------------------------

    fn funded_snapshot(&self, escrow_id: &str) -> Result<(EscrowState, u64), EscrowError> {
        let state = self.load(escrow_id)?;
        ensure_settleable(&state)?;
        let chain_id = funded_id(&state)?;
        Ok((state, chain_id))
    }

    /// Release transaction for the publisher to sign.
    pub async fn prepare_release(&self, escrow_id: &str) -> Result<UnsignedTransactionDescriptor, EscrowError> {
        let (state, chain_escrow_id) = self.funded_snapshot(escrow_id)?;
        Ok(self
            .protocol
            .prepare(PrepareRequest::Release {
                publisher: state.publisher,
                chain_escrow_id,
            })
            .await?)
    }

    /// Submit a publisher-signed release and complete the escrow once it
    /// confirms. `key` is checked against the recorded key hash.
    pub async fn finish_release(
        &self,
        escrow_id: &str,
        key: Option<&EncryptionKey>,
        signed: &SignedSubmission,
    ) -> Result<EscrowState, EscrowError> {
        self.settle(escrow_id, EscrowStatus::Completed, key, signed, None).await
    }

    pub async fn release_payment(
        &self,
        escrow_id: &str,
        key: Option<&EncryptionKey>,
        signer: &dyn TransactionSigner,
    ) -> Result<EscrowState, EscrowError> {
        let descriptor = self.prepare_release(escrow_id).await?;
        let signed = signer.sign(&descriptor).await.map_err(ProtocolError::from)?;
        self.finish_release(escrow_id, key, &signed).await
    }

    /// Refund transaction for the buyer to sign.
    pub async fn prepare_refund(&self, escrow_id: &str) -> Result<UnsignedTransactionDescriptor, EscrowError> {
        let (state, chain_escrow_id) = self.funded_snapshot(escrow_id)?;
        Ok(self
            .protocol
            .prepare(PrepareRequest::Refund {
                buyer: state.buyer,
                chain_escrow_id,
            })
            .await?)
    }

    pub async fn finish_refund(&self, escrow_id: &str, signed: &SignedSubmission) -> Result<EscrowState, EscrowError> {
        self.settle(escrow_id, EscrowStatus::Refunded, None, signed, None).await
    }

    pub async fn refund_payment(
        &self,
        escrow_id: &str,
        signer: &dyn TransactionSigner,
    ) -> Result<EscrowState, EscrowError> {
        let descriptor = self.prepare_refund(escrow_id).await?;
        let signed = signer.sign(&descriptor).await.map_err(ProtocolError::from)?;
        self.finish_refund(escrow_id, &signed).await
    }

    /// Submit, confirm and apply a settlement under the escrow's lock.
    async fn settle(
        &self,
        escrow_id: &str,
        outcome: EscrowStatus,
        key: Option<&EncryptionKey>,
        signed: &SignedSubmission,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<EscrowState, EscrowError> {
        let _guard = self.lock(escrow_id).await;

        let mut state = self.load(escrow_id)?;
        ensure_settleable(&state)?;
        let chain_escrow_id = funded_id(&state)?;
        let request = match outcome {
            EscrowStatus::Completed => PrepareRequest::Release {
                publisher: state.publisher.clone(),
                chain_escrow_id,
            },
            _ => PrepareRequest::Refund {
                buyer: state.buyer.clone(),
                chain_escrow_id,
            },
        };
        self.check_signed(&request, signed)?;
        if let (Some(key), Some(hash)) = (key, state.encryption_key_hash.as_deref()) {
            if !key.matches_hash(hash) {
                return Err(EscrowError::Validation(
                    "encryption key does not match the recorded key hash".into(),
                ));
            }
        }

        let tx_id = self.protocol.submit(signed).await?;
        state.settlement_txn_id = Some(tx_id.clone());
        state.settling = Some(SettlementInFlight {
            outcome,
            key: key.map(EncryptionKey::to_hex),
        });
        state.updated_at = Utc::now();
        self.store.put_escrow(&state)?;
        debug!(escrow_id, tx_id = %tx_id, outcome = %outcome, "settlement submitted");

        let result = self
            .protocol
            .confirm(&tx_id, self.config.settlement_timeout, cancel)
            .await;
        self.apply_settlement(state, result)
    }

    /// Poll the recorded settlement transaction again. For escrows whose
    /// release or refund timed out or was cancelled after the ledger
    /// accepted it.
    pub async fn resume_settlement(
        &self,
        escrow_id: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<EscrowState, EscrowError> {
        let _guard = self.lock(escrow_id).await;
        let state = self.load(escrow_id)?;
        ensure_pending(&state)?;
        let tx_id = match (&state.settling, &state.settlement_txn_id) {
            (Some(_), Some(tx_id)) => tx_id.clone(),
            _ => {
                return Err(EscrowError::Validation(format!(
                    "escrow {escrow_id} has no settlement in flight"
                )))
            }
        };

        info!(escrow_id, tx_id = %tx_id, "resuming settlement confirmation");
        let result = self
            .protocol
            .confirm(&tx_id, self.config.settlement_timeout, cancel)
            .await;
        self.apply_settlement(state, result)
    }

    /// Fold a confirm result into an in-flight settlement. Callers hold
    /// the escrow's lock.
    fn apply_settlement(&self, mut state: EscrowState, result: ConfirmationResult) -> Result<EscrowState, EscrowError> {
        let Some(flight) = state.settling.clone() else {
            return Err(EscrowError::Validation(format!(
                "escrow {} has no settlement in flight",
                state.escrow_id
            )));
        };

        match result.into_confirmed(self.config.settlement_timeout) {
            Ok(confirmed) => {
                let now = Utc::now();
                state.status = flight.outcome;
                state.updated_at = now;
                state.settlement_round = Some(confirmed.round);
                state.settling = None;
                if flight.outcome == EscrowStatus::Completed {
                    state.completed_at = Some(now);
                    if let Some(hex) = flight.key {
                        if let Ok(key) = EncryptionKey::from_hex(&hex) {
                            state.encryption_key_hash = Some(key.hash());
                        }
                        state.encryption_key = Some(hex);
                    }
                }
                self.close(&state)?;
                info!(
                    escrow_id = %state.escrow_id,
                    status = %state.status,
                    round = confirmed.round,
                    "escrow settled"
                );
                Ok(state)
            }
            Err(ProtocolError::Rejected(reason)) => {
                state.settlement_txn_id = None;
                state.settling = None;
                state.updated_at = Utc::now();
                self.store.put_escrow(&state)?;
                warn!(escrow_id = %state.escrow_id, reason = %reason, "settlement rejected, escrow still pending");
                Err(ProtocolError::Rejected(reason).into())
            }
            Err(e) => {
                warn!(escrow_id = %state.escrow_id, error = %e, "settlement still in flight");
                Err(e.into())
            }
        }
    }

    // -- Sweeping -----------------------------------------------------------

    pub async fn cleanup_old_escrows(&self, max_age_hours: u64) -> Result<Vec<String>, EscrowError> {
        self.cleanup_old_escrows_at(max_age_hours, Utc::now()).await
    }

    /// Mark every escrow that has been pending for more than
    /// `max_age_hours` at `now` as failed. Escrows with a settlement in
    /// flight are skipped: the ledger may already have paid out. Returns
    /// the swept ids.
    pub async fn cleanup_old_escrows_at(
        &self,
        max_age_hours: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, EscrowError> {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX).min(i64::MAX / 3_600_000);
        let max_age = chrono::Duration::hours(hours);
        let stale: Vec<String> = self
            .store
            .list_escrows()?
            .into_iter()
            .filter(|e| e.is_pending() && !e.is_settling() && e.age_at(now) > max_age)
            .map(|e| e.escrow_id)
            .collect();

        let mut swept = Vec::with_capacity(stale.len());
        for id in stale {
            let _guard = self.lock(&id).await;
            let mut state = self.load(&id)?;
            if !state.is_pending() || state.is_settling() || state.age_at(now) <= max_age {
                continue;
            }
            state.status = EscrowStatus::Failed;
            state.failure_reason = Some(format!("expired after {max_age_hours}h pending"));
            state.updated_at = now;
            self.close(&state)?;
            debug!(escrow_id = %id, "swept stale escrow");
            swept.push(id);
        }

        if !swept.is_empty() {
            info!(count = swept.len(), max_age_hours, "swept stale escrows");
        }
        Ok(swept)
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "escrow sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup_old_escrows(self.config.max_age_hours).await {
                        warn!(error = %e, "escrow sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("escrow sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    // -- Reads --------------------------------------------------------------

    /// Whether `candidate` (hex key) hashes to the recorded key hash.
    /// Compared in constant time. No recorded hash means `false`.
    pub fn verify_encryption_key(&self, escrow_id: &str, candidate: &str) -> Result<bool, EscrowError> {
        let state = self.load(escrow_id)?;
        let Some(hash) = state.encryption_key_hash.as_deref() else {
            return Ok(false);
        };
        Ok(EncryptionKey::from_hex(candidate)
            .map(|key| key.matches_hash(hash))
            .unwrap_or(false))
    }

    pub fn get_escrow(&self, escrow_id: &str) -> Result<Option<EscrowState>, EscrowError> {
        Ok(self.store.get_escrow(escrow_id)?)
    }

    pub fn list_escrows(&self, filter: &EscrowFilter) -> Result<Vec<EscrowState>, EscrowError> {
        Ok(self
            .store
            .list_escrows()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    pub fn statistics(&self) -> Result<EscrowStatistics, EscrowError> {
        Ok(EscrowStatistics::tally(&self.store.list_escrows()?))
    }

    /// The key for a completed escrow: plain hex, or wrapped for the
    /// buyer's X25519 public key.
    pub fn released_key(&self, escrow_id: &str, buyer_public: Option<&[u8; 32]>) -> Result<ReleasedKey, EscrowError> {
        let state = self.load(escrow_id)?;
        if state.status != EscrowStatus::Completed {
            return Err(conflict(&state));
        }
        let key_hex = state
            .encryption_key
            .ok_or_else(|| EscrowError::Validation(format!("escrow {escrow_id} completed without a key")))?;
        match buyer_public {
            None => Ok(ReleasedKey::Plain(key_hex)),
            Some(public) => {
                let key = EncryptionKey::from_hex(&key_hex)
                    .map_err(|e| EscrowError::Validation(e.to_string()))?;
                let wrapped = wrap_key(key.as_bytes(), public).map_err(|e| EscrowError::Validation(e.to_string()))?;
                Ok(ReleasedKey::Wrapped(wrapped.to_hex()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::crypto::hybrid::{HybridKeypair, WrappedKey};
    use crate::crypto::keys::AccountKeypair;
    use crate::ledger::{AccountInfo, GatewayError, LedgerGateway, NetworkParams, PendingInfo};
    use crate::storage::MemoryEscrowStore;
    use crate::transaction::{decode_frames, itob, KeypairSigner, SignedTransaction, TransactionBody};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Accepts every submission and confirms it at round 100. Purchase
    /// groups log `EscrowID:` with the next chain id.
    #[derive(Default)]
    struct StubLedger {
        stall: AtomicBool,
        reject: AtomicBool,
        submissions: AtomicU32,
        outcomes: DashMap<String, PendingInfo>,
    }

    #[async_trait]
    impl LedgerGateway for StubLedger {
        async fn get_params(&self) -> Result<NetworkParams, GatewayError> {
            Ok(NetworkParams {
                fee: 1_000,
                min_fee: 1_000,
                last_round: 99,
                genesis_id: "stub".into(),
            })
        }

        async fn submit_raw(&self, raw: &[u8]) -> Result<String, GatewayError> {
            let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
            let frames = decode_frames(raw).map_err(|e| GatewayError::Rejected(e.to_string()))?;
            let txs: Vec<SignedTransaction> = frames
                .iter()
                .map(|f| SignedTransaction::from_bytes(f))
                .collect::<Result<_, _>>()
                .map_err(|e| GatewayError::Rejected(e.to_string()))?;

            let mut logs = Vec::new();
            for tx in &txs {
                if let TransactionBody::ApplicationCall { args, .. } = &tx.transaction.body {
                    if args.first().map(Vec::as_slice) == Some(b"create".as_slice()) {
                        let mut line = LOG_PREFIX_ESCROW_ID.as_bytes().to_vec();
                        line.extend_from_slice(&itob(u64::from(n)));
                        logs.push(line);
                    }
                }
            }
            let id = txs[0].id().to_string();
            self.outcomes.insert(
                id.clone(),
                PendingInfo {
                    confirmed_round: Some(100),
                    pool_error: None,
                    logs,
                },
            );
            Ok(id)
        }

        async fn pending_info(&self, tx_id: &str) -> Result<PendingInfo, GatewayError> {
            if self.stall.load(Ordering::SeqCst) {
                return Ok(PendingInfo::default());
            }
            if self.reject.load(Ordering::SeqCst) {
                return Ok(PendingInfo {
                    pool_error: Some("overspend".into()),
                    ..Default::default()
                });
            }
            self.outcomes
                .get(tx_id)
                .map(|p| p.value().clone())
                .ok_or_else(|| GatewayError::NotFound(tx_id.to_string()))
        }

        async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo {
                address: address.into(),
                balance: 1_000_000,
                min_balance: 100_000,
            })
        }
    }

    /// Records every terminal transition it hears about.
    #[derive(Default)]
    struct Closures(parking_lot::Mutex<Vec<(String, EscrowStatus)>>);

    impl EscrowListener for Closures {
        fn escrow_closed(&self, state: &EscrowState) {
            self.0.lock().push((state.escrow_id.clone(), state.status));
        }
    }

    struct Harness {
        machine: Arc<EscrowStateMachine>,
        ledger: Arc<StubLedger>,
        closures: Arc<Closures>,
        buyer: KeypairSigner,
        publisher: KeypairSigner,
        key: EncryptionKey,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(StubLedger::default());
        let protocol = Arc::new(TransactionProtocol::new(
            ledger.clone(),
            ProtocolConfig {
                escrow_address: AccountKeypair::from_seed(&[9u8; 32]).address(),
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        let config = EscrowConfig {
            max_age_hours: 24,
            monitor_timeout: Duration::from_secs(2),
            settlement_timeout: Duration::from_secs(2),
        };
        let closures = Arc::new(Closures::default());
        Harness {
            machine: Arc::new(
                EscrowStateMachine::new(Arc::new(MemoryEscrowStore::new()), protocol, config)
                    .with_listener(closures.clone()),
            ),
            ledger,
            closures,
            buyer: KeypairSigner::new(AccountKeypair::generate()),
            publisher: KeypairSigner::new(AccountKeypair::generate()),
            key: EncryptionKey::generate(),
        }
    }

    impl Harness {
        fn request(&self) -> PurchaseRequest {
            PurchaseRequest {
                model_id: 1,
                buyer: self.buyer.address(),
                publisher: self.publisher.address(),
                price: 500,
                encryption_key_hash: Some(self.key.hash()),
            }
        }

        async fn funded(&self) -> String {
            let id = self.machine.create_escrow(self.request(), &self.buyer).await.unwrap();
            let state = self.machine.confirm_funding(&id, None).await.unwrap();
            assert!(state.is_funded());
            id
        }
    }

    #[tokio::test]
    async fn create_records_pending_escrow() {
        let h = harness();
        let id = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        assert_eq!(id.len(), 64);

        let state = h.machine.get_escrow(&id).unwrap().unwrap();
        assert_eq!(state.status, EscrowStatus::Pending);
        assert_eq!(state.price, 500);
        assert!(state.encryption_key.is_none());
        assert!(!state.is_funded());
        assert_eq!(h.ledger.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_refuses_submission_from_someone_else() {
        let h = harness();
        let desc = h.machine.prepare_purchase(&h.request()).await.unwrap();
        let mallory = KeypairSigner::new(AccountKeypair::generate());
        let mut forged = desc.clone();
        for tx in &mut forged.transactions {
            tx.sender = mallory.address();
        }
        let signed = mallory.sign(&forged).await.unwrap();
        assert!(matches!(
            h.machine.open_escrow(&h.request(), &signed).await,
            Err(EscrowError::Validation(_))
        ));
        assert_eq!(h.ledger.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_refuses_a_group_signed_for_a_lower_price() {
        let h = harness();
        let cheap = PurchaseRequest {
            price: 1,
            ..h.request()
        };
        let desc = h.machine.prepare_purchase(&cheap).await.unwrap();
        let signed = h.buyer.sign(&desc).await.unwrap();

        match h.machine.open_escrow(&h.request(), &signed).await {
            Err(EscrowError::Validation(reason)) => assert!(reason.contains("does not match"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.ledger.submissions.load(Ordering::SeqCst), 0);
        assert!(h.machine.list_escrows(&EscrowFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn refund_signed_for_another_escrow_is_refused() {
        let h = harness();
        let id = h.funded().await;
        let other = h.funded().await;
        let desc = h.machine.prepare_refund(&other).await.unwrap();
        let signed = h.buyer.sign(&desc).await.unwrap();

        assert!(matches!(
            h.machine.finish_refund(&id, &signed).await,
            Err(EscrowError::Validation(_))
        ));
        assert!(h.machine.get_escrow(&id).unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn monitor_funds_then_releases() {
        let h = harness();
        let id = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        let state = h
            .machine
            .monitor_escrow(&id, Some(&h.key), Some(&h.publisher), None)
            .await
            .unwrap();

        assert_eq!(state.status, EscrowStatus::Completed);
        assert_eq!(state.payment_round, Some(100));
        assert_eq!(state.chain_escrow_id, Some(1));
        assert!(state.completed_at.is_some());
        assert_eq!(state.encryption_key.as_deref(), Some(h.key.to_hex().as_str()));
        assert!(h.machine.verify_encryption_key(&id, &h.key.to_hex()).unwrap());
        assert!(!h
            .machine
            .verify_encryption_key(&id, &EncryptionKey::generate().to_hex())
            .unwrap());
        assert!(!h.machine.verify_encryption_key(&id, "not hex").unwrap());
    }

    #[tokio::test]
    async fn second_release_conflicts_and_changes_nothing() {
        let h = harness();
        let id = h.funded().await;
        let first = h.machine.release_payment(&id, Some(&h.key), &h.publisher).await.unwrap();

        let err = h
            .machine
            .release_payment(&id, Some(&EncryptionKey::generate()), &h.publisher)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::StateConflict { status: EscrowStatus::Completed, .. }));

        let after = h.machine.get_escrow(&id).unwrap().unwrap();
        assert_eq!(after.completed_at, first.completed_at);
        assert_eq!(after.encryption_key, first.encryption_key);
    }

    #[tokio::test]
    async fn concurrent_releases_serialize() {
        let h = harness();
        let id = h.funded().await;

        let spawn_release = |h: &Harness| {
            let machine = h.machine.clone();
            let signer = h.publisher.clone();
            let key = h.key.clone();
            let id = id.clone();
            tokio::spawn(async move { machine.release_payment(&id, Some(&key), &signer).await })
        };
        let a = spawn_release(&h);
        let b = spawn_release(&h);
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(EscrowError::StateConflict { .. })))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
        assert!(h.machine.locks.is_empty());
    }

    #[tokio::test]
    async fn release_needs_funding_and_the_right_key() {
        let h = harness();
        let id = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        assert!(matches!(
            h.machine.prepare_release(&id).await,
            Err(EscrowError::Validation(_))
        ));

        h.machine.confirm_funding(&id, None).await.unwrap();
        let wrong = EncryptionKey::generate();
        assert!(matches!(
            h.machine.release_payment(&id, Some(&wrong), &h.publisher).await,
            Err(EscrowError::Validation(_))
        ));
        assert!(h.machine.get_escrow(&id).unwrap().unwrap().is_pending());

        // The buyer cannot release on the publisher's behalf.
        let desc = h.machine.prepare_release(&id).await.unwrap();
        assert!(h.buyer.sign(&desc).await.is_err());
    }

    #[tokio::test]
    async fn refund_is_terminal() {
        let h = harness();
        let id = h.funded().await;
        let state = h.machine.refund_payment(&id, &h.buyer).await.unwrap();
        assert_eq!(state.status, EscrowStatus::Refunded);
        assert!(state.encryption_key.is_none());
        assert!(state.completed_at.is_none());

        assert!(matches!(
            h.machine.release_payment(&id, Some(&h.key), &h.publisher).await,
            Err(EscrowError::StateConflict { status: EscrowStatus::Refunded, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_payment_fails_the_escrow() {
        let h = harness();
        let id = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        h.ledger.stall.store(true, Ordering::SeqCst);

        let state = h.machine.confirm_funding(&id, None).await.unwrap();
        assert_eq!(state.status, EscrowStatus::Failed);
        assert!(state.failure_reason.unwrap().contains("not confirmed"));
        assert!(matches!(
            h.machine.confirm_funding(&id, None).await,
            Err(EscrowError::StateConflict { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_release_is_resumed_not_resubmitted() {
        let h = harness();
        let id = h.funded().await;
        h.ledger.stall.store(true, Ordering::SeqCst);

        let err = h
            .machine
            .release_payment(&id, Some(&h.key), &h.publisher)
            .await
            .unwrap_err();
        let tx_id = match err {
            EscrowError::Protocol(ProtocolError::ConfirmationTimeout { tx_id, .. }) => tx_id,
            other => panic!("unexpected {other:?}"),
        };
        let state = h.machine.get_escrow(&id).unwrap().unwrap();
        assert!(state.is_pending());
        assert!(state.is_settling());
        assert_eq!(state.settlement_txn_id.as_deref(), Some(tx_id.as_str()));

        // A second release would be a second transaction for the same escrow.
        h.ledger.stall.store(false, Ordering::SeqCst);
        let submissions = h.ledger.submissions.load(Ordering::SeqCst);
        assert!(matches!(
            h.machine.release_payment(&id, Some(&h.key), &h.publisher).await,
            Err(EscrowError::SettlementInFlight { .. })
        ));
        assert_eq!(h.ledger.submissions.load(Ordering::SeqCst), submissions);

        // The sweeper leaves it alone however old it gets.
        let later = state.created_at + chrono::Duration::hours(48);
        assert!(h.machine.cleanup_old_escrows_at(24, later).await.unwrap().is_empty());

        let done = h.machine.resume_settlement(&id, None).await.unwrap();
        assert_eq!(done.status, EscrowStatus::Completed);
        assert_eq!(done.settlement_round, Some(100));
        assert_eq!(done.settlement_txn_id, Some(tx_id));
        assert_eq!(done.encryption_key.as_deref(), Some(h.key.to_hex().as_str()));
        assert!(!done.is_settling());
        assert_eq!(h.closures.0.lock().as_slice(), &[(id.clone(), EscrowStatus::Completed)]);

        assert!(matches!(
            h.machine.resume_settlement(&id, None).await,
            Err(EscrowError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_refund_can_be_tried_again() {
        let h = harness();
        let id = h.funded().await;
        h.ledger.reject.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.machine.refund_payment(&id, &h.buyer).await,
            Err(EscrowError::Protocol(ProtocolError::Rejected(_)))
        ));
        let state = h.machine.get_escrow(&id).unwrap().unwrap();
        assert!(!state.is_settling());
        assert!(state.settlement_txn_id.is_none());
        assert!(matches!(
            h.machine.resume_settlement(&id, None).await,
            Err(EscrowError::Validation(_))
        ));

        h.ledger.reject.store(false, Ordering::SeqCst);
        let state = h.machine.refund_payment(&id, &h.buyer).await.unwrap();
        assert_eq!(state.status, EscrowStatus::Refunded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_leaves_escrow_pending() {
        let h = harness();
        let id = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        h.ledger.stall.store(true, Ordering::SeqCst);

        let (tx, rx) = watch::channel(false);
        let machine = h.machine.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move { machine.monitor_escrow(&task_id, None, None, Some(rx)).await });
        tokio::time::sleep(Duration::from_millis(350)).await;
        tx.send(true).unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(EscrowError::Protocol(ProtocolError::Cancelled))
        ));
        assert!(h.machine.get_escrow(&id).unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_stale_pending() {
        let h = harness();
        let stale = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        let done = h.funded().await;
        h.machine.release_payment(&done, Some(&h.key), &h.publisher).await.unwrap();

        let created = h.machine.get_escrow(&stale).unwrap().unwrap().created_at;
        let later = created + chrono::Duration::hours(2);

        assert!(h.machine.cleanup_old_escrows_at(1, created).await.unwrap().is_empty());
        let swept = h.machine.cleanup_old_escrows_at(1, later).await.unwrap();
        assert_eq!(swept, vec![stale.clone()]);

        let state = h.machine.get_escrow(&stale).unwrap().unwrap();
        assert_eq!(state.status, EscrowStatus::Failed);
        assert!(state.failure_reason.is_some());
        assert!(h.closures.0.lock().contains(&(stale.clone(), EscrowStatus::Failed)));
        assert!(h.machine.locks.is_empty());
        assert_eq!(
            h.machine.get_escrow(&done).unwrap().unwrap().status,
            EscrowStatus::Completed
        );
        assert!(h.machine.cleanup_old_escrows_at(1, later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_key_plain_and_wrapped() {
        let h = harness();
        let id = h.funded().await;
        assert!(matches!(
            h.machine.released_key(&id, None),
            Err(EscrowError::StateConflict { .. })
        ));
        h.machine.release_payment(&id, Some(&h.key), &h.publisher).await.unwrap();

        assert_eq!(h.machine.released_key(&id, None).unwrap(), ReleasedKey::Plain(h.key.to_hex()));

        let buyer_x = HybridKeypair::generate();
        match h.machine.released_key(&id, Some(&buyer_x.public_bytes())).unwrap() {
            ReleasedKey::Wrapped(hex) => {
                let wrapped = WrappedKey::from_hex(&hex).unwrap();
                assert_eq!(&buyer_x.unwrap_key(&wrapped).unwrap(), h.key.as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn listing_and_statistics() {
        let h = harness();
        let a = h.funded().await;
        let _b = h.machine.create_escrow(h.request(), &h.buyer).await.unwrap();
        h.machine.release_payment(&a, Some(&h.key), &h.publisher).await.unwrap();

        let stats = h.machine.statistics().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.settled_volume, 500);

        let pending = h.machine.list_escrows(&EscrowFilter::with_status(EscrowStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(h.machine.get_escrow("nope"), Ok(None)));
        assert!(matches!(
            h.machine.verify_encryption_key("nope", "00"),
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.machine.clone().run_sweeper(Duration::from_secs(60), rx));
        tokio::time::sleep(Duration::from_secs(120)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
