//! # Two-Phase Transaction Protocol
//!
//! Every ledger-backed operation in the marketplace goes through the same
//! four steps, and the core only performs three of them:
//!
//! 1. **prepare**: build an unsigned descriptor from a typed request. The
//!    only network call is `get_params`.
//! 2. *(external)* the user's wallet signs it.
//! 3. **submit**: hand the signed bytes to the gateway, unchanged. Flows
//!    that act on the result first run [`TransactionProtocol::check_submission`]
//!    so a wallet cannot sign something other than what was prepared.
//! 4. **confirm**: poll until the ledger reports a confirmed round, the
//!    pool evicts the transaction, the budget runs out, or the caller
//!    cancels.
//!
//! ## Polling
//!
//! The poll interval is fixed (one second in production). The budget is
//! `timeout / interval` polls, full stop: a zero timeout makes zero gateway
//! calls. A gateway error during polling means "not yet", not failure. A
//! `pool_error` is terminal. The deadline is measured on the monotonic
//! `tokio` clock, so paused-time tests see exactly the same behaviour as
//! production.
//!
//! Cancellation is a `watch::Receiver<bool>`; flipping it to `true` ends
//! the loop at the next poll or mid-sleep. A cancelled confirm reports
//! `confirmed: false` and nothing downstream may treat that as success.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::builder::{TransactionBuilder, UnsignedTransactionDescriptor};
use super::error::ProtocolError;
use super::signing::{SignedSubmission, SignedTransaction, TransactionSigner};
use super::types::{itob, TransactionBody, TransactionKind, TransactionPhase};
use super::verification::{verify_group, verify_structure};
use crate::config::{ProtocolConfig, MAX_NAME_LENGTH, NAME_SUFFIX};
use crate::crypto::keys::is_valid_address;
use crate::ledger::LedgerGateway;

// ---------------------------------------------------------------------------
// Requests & results
// ---------------------------------------------------------------------------

/// A typed request for an unsigned descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareRequest {
    /// `publish(cid, license)` on the registry.
    Register {
        publisher: String,
        cid: String,
        license: String,
    },
    /// Payment to the escrow account grouped with `create(model_id, price)`.
    Purchase {
        buyer: String,
        publisher: String,
        model_id: u64,
        price: u64,
    },
    Release {
        publisher: String,
        chain_escrow_id: u64,
    },
    Refund {
        buyer: String,
        chain_escrow_id: u64,
    },
    /// One call on the NameRegistry, sent by `sender`.
    Name {
        sender: String,
        name: String,
        action: NameAction,
    },
}

impl PrepareRequest {
    pub fn kind(&self) -> TransactionKind {
        match self {
            PrepareRequest::Register { .. } => TransactionKind::Register,
            PrepareRequest::Purchase { .. } => TransactionKind::Purchase,
            PrepareRequest::Release { .. } => TransactionKind::Release,
            PrepareRequest::Refund { .. } => TransactionKind::Refund,
            PrepareRequest::Name { .. } => TransactionKind::Name,
        }
    }
}

/// NameRegistry methods and their arguments past the name itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameAction {
    Register { cid: String, price: u64 },
    Update { cid: String, price: u64 },
    Transfer { new_owner: String },
    Delete,
    Resolve,
    Exists,
}

impl NameAction {
    pub fn method(&self) -> &'static str {
        match self {
            NameAction::Register { .. } => "register",
            NameAction::Update { .. } => "update",
            NameAction::Transfer { .. } => "transfer",
            NameAction::Delete => "delete",
            NameAction::Resolve => "resolve",
            NameAction::Exists => "exists",
        }
    }
}

/// Why a confirm did not end in a confirmed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationFailure {
    Timeout,
    Rejected(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub tx_id: String,
    pub confirmed: bool,
    pub round: Option<u64>,
    pub logs: Vec<Vec<u8>>,
    pub error: Option<ConfirmationFailure>,
    /// Gateway calls spent.
    pub polls: u32,
}

/// A confirmed transaction: always carries a concrete round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub tx_id: String,
    pub round: u64,
    pub logs: Vec<Vec<u8>>,
}

impl ConfirmationResult {
    fn failed(tx_id: &str, error: ConfirmationFailure, polls: u32) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            confirmed: false,
            round: None,
            logs: Vec::new(),
            error: Some(error),
            polls,
        }
    }

    /// Collapse into a `Result`. `timeout` only feeds the error message.
    pub fn into_confirmed(self, timeout: Duration) -> Result<Confirmed, ProtocolError> {
        match (self.confirmed, self.round, self.error) {
            (true, Some(round), _) => Ok(Confirmed {
                tx_id: self.tx_id,
                round,
                logs: self.logs,
            }),
            (_, _, Some(ConfirmationFailure::Rejected(reason))) => Err(ProtocolError::Rejected(reason)),
            (_, _, Some(ConfirmationFailure::Cancelled)) => Err(ProtocolError::Cancelled),
            _ => Err(ProtocolError::ConfirmationTimeout {
                tx_id: self.tx_id,
                timeout,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase tracking
// ---------------------------------------------------------------------------

/// Enforces `Built → AwaitingSignature → Submitted → terminal` for one
/// request. Out-of-order steps are caller bugs and come back as
/// validation errors.
#[derive(Debug, Clone)]
pub struct ConfirmationTracker {
    phase: TransactionPhase,
    tx_id: Option<String>,
}

impl Default for ConfirmationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self {
            phase: TransactionPhase::Built,
            tx_id: None,
        }
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.tx_id.as_deref()
    }

    fn advance(&mut self, from: TransactionPhase, to: TransactionPhase) -> Result<(), ProtocolError> {
        if self.phase != from {
            return Err(ProtocolError::Validation(format!(
                "cannot move to {to} from {}",
                self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }

    pub fn awaiting_signature(&mut self) -> Result<(), ProtocolError> {
        self.advance(TransactionPhase::Built, TransactionPhase::AwaitingSignature)
    }

    pub fn submitted(&mut self, tx_id: &str) -> Result<(), ProtocolError> {
        self.advance(TransactionPhase::AwaitingSignature, TransactionPhase::Submitted)?;
        self.tx_id = Some(tx_id.to_string());
        Ok(())
    }

    /// Record the outcome of a confirm. Cancellation leaves the request in
    /// `Submitted` so it can be confirmed again later.
    pub fn finish(&mut self, result: &ConfirmationResult) -> Result<(), ProtocolError> {
        let to = match (&result.error, result.confirmed && result.round.is_some()) {
            (_, true) => TransactionPhase::Confirmed,
            (Some(ConfirmationFailure::Rejected(_)), _) => TransactionPhase::Rejected,
            (Some(ConfirmationFailure::Cancelled), _) => return Ok(()),
            _ => TransactionPhase::TimedOut,
        };
        self.advance(TransactionPhase::Submitted, to)
    }
}

// ---------------------------------------------------------------------------
// TransactionProtocol
// ---------------------------------------------------------------------------

pub struct TransactionProtocol {
    gateway: Arc<dyn LedgerGateway>,
    config: ProtocolConfig,
}

impl TransactionProtocol {
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: ProtocolConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn LedgerGateway> {
        &self.gateway
    }

    /// Build the unsigned descriptor for `request`.
    pub async fn prepare(&self, request: PrepareRequest) -> Result<UnsignedTransactionDescriptor, ProtocolError> {
        self.validate(&request)?;
        let params = self.gateway.get_params().await?;
        let window = self.config.validity_window;

        let mut transactions: Vec<_> = self
            .expected_members(&request)
            .into_iter()
            .map(|(sender, body)| {
                TransactionBuilder::from_body(&sender, body)
                    .note(fresh_note())
                    .params(&params, window)
                    .build()
            })
            .collect();

        let kind = request.kind();
        let descriptor = if transactions.len() == 1 {
            UnsignedTransactionDescriptor::single(kind, transactions.remove(0))
        } else {
            UnsignedTransactionDescriptor::group(kind, transactions)
        };

        debug!(
            kind = %descriptor.kind,
            txns = descriptor.transactions.len(),
            first_valid = params.last_round,
            "prepared unsigned descriptor"
        );
        Ok(descriptor)
    }

    /// Sender and body of every member `request` turns into, in group
    /// order. Fee, validity and note are left to `prepare`.
    pub fn expected_members(&self, request: &PrepareRequest) -> Vec<(String, TransactionBody)> {
        let call = |app_id: u64, args: Vec<Vec<u8>>, accounts: Vec<String>| TransactionBody::ApplicationCall {
            app_id,
            args,
            accounts,
        };
        let escrow_app = self.config.escrow_app_id;

        match request {
            PrepareRequest::Register {
                publisher,
                cid,
                license,
            } => vec![(
                publisher.clone(),
                call(
                    self.config.registry_app_id,
                    vec![b"publish".to_vec(), cid.as_bytes().to_vec(), license.as_bytes().to_vec()],
                    Vec::new(),
                ),
            )],
            PrepareRequest::Purchase {
                buyer,
                publisher,
                model_id,
                price,
            } => vec![
                (
                    buyer.clone(),
                    TransactionBody::Payment {
                        receiver: self.config.escrow_address.clone(),
                        amount: *price,
                    },
                ),
                (
                    buyer.clone(),
                    call(
                        escrow_app,
                        vec![b"create".to_vec(), itob(*model_id), itob(*price)],
                        vec![publisher.clone()],
                    ),
                ),
            ],
            PrepareRequest::Release {
                publisher,
                chain_escrow_id,
            } => vec![(
                publisher.clone(),
                call(escrow_app, vec![b"release".to_vec(), itob(*chain_escrow_id)], Vec::new()),
            )],
            PrepareRequest::Refund { buyer, chain_escrow_id } => vec![(
                buyer.clone(),
                call(escrow_app, vec![b"refund".to_vec(), itob(*chain_escrow_id)], Vec::new()),
            )],
            PrepareRequest::Name { sender, name, action } => {
                let mut args = vec![action.method().as_bytes().to_vec(), name.as_bytes().to_vec()];
                match action {
                    NameAction::Register { cid, price } | NameAction::Update { cid, price } => {
                        args.push(cid.as_bytes().to_vec());
                        args.push(itob(*price));
                    }
                    NameAction::Transfer { new_owner } => args.push(new_owner.as_bytes().to_vec()),
                    NameAction::Delete | NameAction::Resolve | NameAction::Exists => {}
                }
                vec![(sender.clone(), call(self.config.name_registry_app_id, args, Vec::new()))]
            }
        }
    }

    /// Decode `submission` and make sure it is exactly what `request`
    /// prepares: same member count, same senders, same bodies, correctly
    /// grouped and signed. Only fee, validity window and note may differ.
    pub fn check_submission(
        &self,
        request: &PrepareRequest,
        submission: &SignedSubmission,
    ) -> Result<Vec<SignedTransaction>, ProtocolError> {
        self.validate(request)?;
        let members = submission.transactions()?;
        let expected = self.expected_members(request);
        let kind = request.kind();

        if members.len() != expected.len() {
            return Err(ProtocolError::Validation(format!(
                "{kind} expects {} signed transaction(s), got {}",
                expected.len(),
                members.len()
            )));
        }
        if expected.len() == 1 && members[0].transaction.group.is_some() {
            return Err(ProtocolError::Validation(format!("{kind} must not be grouped")));
        }

        for (i, (member, (sender, body))) in members.iter().zip(&expected).enumerate() {
            let tx = &member.transaction;
            if &tx.sender != sender {
                return Err(ProtocolError::Validation(format!(
                    "{kind} member {i} is signed by {}, expected {sender}",
                    tx.sender
                )));
            }
            if &tx.body != body {
                return Err(ProtocolError::Validation(format!(
                    "{kind} member {i} does not match the prepared request"
                )));
            }
        }

        verify_group(&members)?;
        Ok(members)
    }

    fn validate(&self, request: &PrepareRequest) -> Result<(), ProtocolError> {
        let check = |label: &str, addr: &str| {
            if is_valid_address(addr) {
                Ok(())
            } else {
                Err(ProtocolError::Validation(format!("invalid {label} address '{addr}'")))
            }
        };
        match request {
            PrepareRequest::Register { publisher, cid, .. } => {
                check("publisher", publisher)?;
                if cid.trim().is_empty() {
                    return Err(ProtocolError::Validation("content id is empty".into()));
                }
            }
            PrepareRequest::Purchase {
                buyer,
                publisher,
                price,
                ..
            } => {
                check("buyer", buyer)?;
                check("publisher", publisher)?;
                check("escrow", &self.config.escrow_address)?;
                if *price == 0 {
                    return Err(ProtocolError::Validation("price must be > 0".into()));
                }
                if buyer == publisher {
                    return Err(ProtocolError::Validation("buyer and publisher must differ".into()));
                }
            }
            PrepareRequest::Release { publisher, .. } => check("publisher", publisher)?,
            PrepareRequest::Refund { buyer, .. } => check("buyer", buyer)?,
            PrepareRequest::Name { sender, name, action } => {
                check("sender", sender)?;
                validate_name(name)?;
                match action {
                    NameAction::Register { cid, .. } | NameAction::Update { cid, .. } if cid.trim().is_empty() => {
                        return Err(ProtocolError::Validation("content id is empty".into()));
                    }
                    NameAction::Transfer { new_owner } => {
                        check("new owner", new_owner)?;
                        if new_owner == sender {
                            return Err(ProtocolError::Validation("name already belongs to the sender".into()));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Check that `address` can spend `amount` on top of its minimum
    /// balance.
    pub async fn ensure_spendable(&self, address: &str, amount: u64) -> Result<(), ProtocolError> {
        let info = self.gateway.account_info(address).await?;
        if info.spendable() < amount {
            return Err(ProtocolError::InsufficientFunds {
                address: address.to_string(),
                spendable: info.spendable(),
                required: amount,
            });
        }
        Ok(())
    }

    /// Submit externally signed bytes. Returns the ledger's transaction id.
    pub async fn submit(&self, submission: &SignedSubmission) -> Result<String, ProtocolError> {
        let raw = submission.encode()?;
        for tx in submission.transactions()? {
            verify_structure(&tx.transaction)?;
        }

        match self.gateway.submit_raw(&raw).await {
            Ok(tx_id) => {
                info!(tx_id = %tx_id, bytes = raw.len(), "submitted signed transaction");
                Ok(tx_id)
            }
            Err(e) => {
                warn!(error = %e, "gateway refused submission");
                Err(ProtocolError::Submission(e.to_string()))
            }
        }
    }

    /// Poll for confirmation with the configured interval.
    pub async fn confirm(
        &self,
        tx_id: &str,
        timeout: Duration,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> ConfirmationResult {
        let interval = self.config.poll_interval.max(Duration::from_millis(1));
        let budget = (timeout.as_millis() / interval.as_millis()).min(u32::MAX as u128) as u32;
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        while polls < budget {
            if is_cancelled(&cancel) {
                return ConfirmationResult::failed(tx_id, ConfirmationFailure::Cancelled, polls);
            }

            polls += 1;
            match self.gateway.pending_info(tx_id).await {
                Ok(info) => {
                    if let Some(reason) = info.pool_error.filter(|r| !r.is_empty()) {
                        warn!(tx_id, reason = %reason, "transaction rejected by pool");
                        return ConfirmationResult::failed(tx_id, ConfirmationFailure::Rejected(reason), polls);
                    }
                    if let Some(round) = info.confirmed_round.filter(|r| *r > 0) {
                        info!(tx_id, round, polls, "transaction confirmed");
                        return ConfirmationResult {
                            tx_id: tx_id.to_string(),
                            confirmed: true,
                            round: Some(round),
                            logs: info.logs,
                            error: None,
                            polls,
                        };
                    }
                    debug!(tx_id, poll = polls, "not confirmed yet");
                }
                Err(e) => debug!(tx_id, poll = polls, error = %e, "gateway poll failed, treating as pending"),
            }

            if polls >= budget || Instant::now() >= deadline {
                break;
            }
            if sleep_or_cancel(interval, &mut cancel).await {
                return ConfirmationResult::failed(tx_id, ConfirmationFailure::Cancelled, polls);
            }
        }

        warn!(tx_id, polls, timeout_ms = timeout.as_millis() as u64, "confirmation timed out");
        ConfirmationResult::failed(tx_id, ConfirmationFailure::Timeout, polls)
    }

    /// Sign, submit and confirm in one go, tracking phases. For callers
    /// that own a [`TransactionSigner`] (devnet, tests, CLI).
    pub async fn execute(
        &self,
        descriptor: &UnsignedTransactionDescriptor,
        signer: &dyn TransactionSigner,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Confirmed, ProtocolError> {
        let mut tracker = ConfirmationTracker::new();
        tracker.awaiting_signature()?;
        let signed = signer.sign(descriptor).await?;
        let tx_id = self.submit(&signed).await?;
        tracker.submitted(&tx_id)?;
        let result = self.confirm(&tx_id, timeout, cancel).await;
        tracker.finish(&result)?;
        result.into_confirmed(timeout)
    }
}

/// `label.desci`, lowercase letters, digits and hyphens, at most
/// [`MAX_NAME_LENGTH`] bytes in total.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let label = name
        .strip_suffix(NAME_SUFFIX)
        .ok_or_else(|| ProtocolError::Validation(format!("name '{name}' must end in {NAME_SUFFIX}")))?;
    if label.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::Validation(format!(
            "name '{name}' must be 1..={MAX_NAME_LENGTH} bytes with a non-empty label"
        )));
    }
    if label.starts_with('-')
        || label.ends_with('-')
        || !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(ProtocolError::Validation(format!(
            "name '{name}' may only use a-z, 0-9 and inner hyphens"
        )));
    }
    Ok(())
}

/// Random note so two otherwise identical requests get distinct ids.
fn fresh_note() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes().to_vec()
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map_or(false, |rx| *rx.borrow())
}

enum Wake {
    Elapsed,
    Changed,
    Closed,
}

/// Sleep for `delay`, waking early if cancellation is signalled. Returns
/// `true` if cancelled. A dropped sender just means nobody can cancel any
/// more.
async fn sleep_or_cancel(delay: Duration, cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        let wake = match cancel.as_mut() {
            Some(rx) => tokio::select! {
                _ = &mut sleep => Wake::Elapsed,
                changed = rx.changed() => if changed.is_ok() { Wake::Changed } else { Wake::Closed },
            },
            None => {
                (&mut sleep).await;
                Wake::Elapsed
            }
        };
        match wake {
            Wake::Elapsed => return false,
            Wake::Changed if is_cancelled(cancel) => return true,
            Wake::Changed => continue,
            Wake::Closed => *cancel = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::AccountKeypair;
    use crate::ledger::{AccountInfo, GatewayError, NetworkParams, PendingInfo};
    use crate::transaction::builder::assign_group;
    use crate::transaction::signing::{sign_transaction, KeypairSigner};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Gateway that confirms after `confirm_after` polls, or rejects, and
    /// counts every call.
    struct ScriptedGateway {
        polls: AtomicU32,
        confirm_after: Option<u32>,
        reject: Option<String>,
        fail_first: u32,
        submitted: Mutex<Vec<Vec<u8>>>,
        refuse_submit: bool,
    }

    impl ScriptedGateway {
        fn confirming(after: u32) -> Self {
            Self {
                polls: AtomicU32::new(0),
                confirm_after: Some(after),
                reject: None,
                fail_first: 0,
                submitted: Mutex::new(Vec::new()),
                refuse_submit: false,
            }
        }

        fn never() -> Self {
            Self {
                confirm_after: None,
                ..Self::confirming(0)
            }
        }
    }

    #[async_trait]
    impl LedgerGateway for ScriptedGateway {
        async fn get_params(&self) -> Result<NetworkParams, GatewayError> {
            Ok(NetworkParams {
                fee: 1_000,
                min_fee: 1_000,
                last_round: 99,
                genesis_id: "test".into(),
            })
        }

        async fn submit_raw(&self, raw: &[u8]) -> Result<String, GatewayError> {
            if self.refuse_submit {
                return Err(GatewayError::Rejected("overspend".into()));
            }
            self.submitted.lock().push(raw.to_vec());
            Ok("tx-1".into())
        }

        async fn pending_info(&self, _tx_id: &str) -> Result<PendingInfo, GatewayError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(GatewayError::Unavailable("flaky".into()));
            }
            if let Some(reason) = &self.reject {
                return Ok(PendingInfo {
                    pool_error: Some(reason.clone()),
                    ..Default::default()
                });
            }
            match self.confirm_after {
                Some(after) if n >= after => Ok(PendingInfo {
                    confirmed_round: Some(100),
                    pool_error: None,
                    logs: vec![b"ModelID:\x00\x00\x00\x00\x00\x00\x00\x01".to_vec()],
                }),
                _ => Ok(PendingInfo::default()),
            }
        }

        async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo {
                address: address.into(),
                balance: 10_000,
                min_balance: 1_000,
            })
        }
    }

    fn protocol(gw: Arc<ScriptedGateway>) -> TransactionProtocol {
        let escrow = AccountKeypair::from_seed(&[7u8; 32]).address();
        TransactionProtocol::new(
            gw,
            ProtocolConfig {
                escrow_address: escrow,
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_makes_no_gateway_calls() {
        let gw = Arc::new(ScriptedGateway::confirming(1));
        let p = protocol(gw.clone());
        let r = p.confirm("tx-1", Duration::ZERO, None).await;
        assert!(!r.confirmed);
        assert_eq!(r.error, Some(ConfirmationFailure::Timeout));
        assert_eq!(r.polls, 0);
        assert_eq!(gw.polls.load(Ordering::SeqCst), 0);
        assert_eq!(
            r.into_confirmed(Duration::ZERO),
            Err(ProtocolError::ConfirmationTimeout {
                tx_id: "tx-1".into(),
                timeout: Duration::ZERO,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_after_a_few_polls() {
        let gw = Arc::new(ScriptedGateway::confirming(3));
        let p = protocol(gw.clone());
        let started = Instant::now();
        let r = p.confirm("tx-1", Duration::from_secs(30), None).await;
        assert!(r.confirmed);
        assert_eq!(r.round, Some(100));
        assert_eq!(r.polls, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_caps_gateway_calls() {
        let gw = Arc::new(ScriptedGateway::never());
        let p = protocol(gw.clone());
        let r = p.confirm("tx-1", Duration::from_millis(5_500), None).await;
        assert_eq!(r.error, Some(ConfirmationFailure::Timeout));
        assert_eq!(gw.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_errors_mean_not_yet() {
        let gw = Arc::new(ScriptedGateway {
            fail_first: 2,
            ..ScriptedGateway::confirming(3)
        });
        let r = protocol(gw).confirm("tx-1", Duration::from_secs(10), None).await;
        assert!(r.confirmed);
        assert_eq!(r.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_error_is_terminal() {
        let gw = Arc::new(ScriptedGateway {
            reject: Some("fee too low".into()),
            ..ScriptedGateway::never()
        });
        let r = protocol(gw.clone()).confirm("tx-1", Duration::from_secs(10), None).await;
        assert_eq!(r.error, Some(ConfirmationFailure::Rejected("fee too low".into())));
        assert_eq!(gw.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let gw = Arc::new(ScriptedGateway::never());
        let p = protocol(gw.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { p.confirm("tx-1", Duration::from_secs(60), Some(rx)).await });
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tx.send(true).unwrap();
        let r = handle.await.unwrap();
        assert!(!r.confirmed);
        assert_eq!(r.error, Some(ConfirmationFailure::Cancelled));
        assert!(gw.polls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_cancel_sender_is_harmless() {
        let gw = Arc::new(ScriptedGateway::confirming(2));
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let r = protocol(gw).confirm("tx-1", Duration::from_secs(5), Some(rx)).await;
        assert!(r.confirmed);
    }

    #[tokio::test]
    async fn prepare_purchase_builds_a_group() {
        let gw = Arc::new(ScriptedGateway::never());
        let p = protocol(gw);
        let buyer = AccountKeypair::generate().address();
        let publisher = AccountKeypair::generate().address();
        let desc = p
            .prepare(PrepareRequest::Purchase {
                buyer: buyer.clone(),
                publisher: publisher.clone(),
                model_id: 1,
                price: 500,
            })
            .await
            .unwrap();

        assert_eq!(desc.kind, TransactionKind::Purchase);
        assert_eq!(desc.transactions.len(), 2);
        assert!(desc.group_id.is_some());
        match &desc.transactions[0].body {
            TransactionBody::Payment { receiver, amount } => {
                assert_eq!(receiver, &p.config().escrow_address);
                assert_eq!(*amount, 500);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &desc.transactions[1].body {
            TransactionBody::ApplicationCall { app_id, args, accounts } => {
                assert_eq!(*app_id, p.config().escrow_app_id);
                assert_eq!(args[0], b"create");
                assert_eq!(args[1], itob(1));
                assert_eq!(args[2], itob(500));
                assert_eq!(accounts, &vec![publisher]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(desc.transactions[0].first_valid, 99);
        assert_eq!(desc.transactions[0].last_valid, 1_099);
    }

    #[tokio::test]
    async fn prepare_validates_input() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let a = AccountKeypair::generate().address();
        let bad = [
            PrepareRequest::Register {
                publisher: "nope".into(),
                cid: "Qm".into(),
                license: "MIT".into(),
            },
            PrepareRequest::Register {
                publisher: a.clone(),
                cid: " ".into(),
                license: "MIT".into(),
            },
            PrepareRequest::Purchase {
                buyer: a.clone(),
                publisher: a.clone(),
                model_id: 1,
                price: 5,
            },
            PrepareRequest::Purchase {
                buyer: a.clone(),
                publisher: AccountKeypair::generate().address(),
                model_id: 1,
                price: 0,
            },
        ];
        for req in bad {
            assert!(matches!(p.prepare(req).await, Err(ProtocolError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn submit_rejects_empty_and_surfaces_gateway_reason() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        assert!(matches!(
            p.submit(&SignedSubmission::Single(vec![])).await,
            Err(ProtocolError::Submission(_))
        ));

        let refusing = Arc::new(ScriptedGateway {
            refuse_submit: true,
            ..ScriptedGateway::never()
        });
        let p = protocol(refusing);
        let kp = AccountKeypair::generate();
        let desc = p
            .prepare(PrepareRequest::Register {
                publisher: kp.address(),
                cid: "QmX".into(),
                license: "MIT".into(),
            })
            .await
            .unwrap();
        let signed = KeypairSigner::new(kp).sign(&desc).await.unwrap();
        match p.submit(&signed).await {
            Err(ProtocolError::Submission(reason)) => assert!(reason.contains("overspend")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn execute_runs_the_whole_lifecycle() {
        let gw = Arc::new(ScriptedGateway::confirming(1));
        let p = protocol(gw.clone());
        let kp = AccountKeypair::generate();
        let desc = p
            .prepare(PrepareRequest::Register {
                publisher: kp.address(),
                cid: "QmX".into(),
                license: "MIT".into(),
            })
            .await
            .unwrap();
        let confirmed = p
            .execute(&desc, &KeypairSigner::new(kp), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(confirmed.round, 100);
        assert_eq!(gw.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn ensure_spendable_respects_min_balance() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        assert!(p.ensure_spendable("desci1x", 9_000).await.is_ok());
        assert!(matches!(
            p.ensure_spendable("desci1x", 9_001).await,
            Err(ProtocolError::InsufficientFunds { spendable: 9_000, .. })
        ));
    }

    fn purchase(buyer: &AccountKeypair, publisher: &str, price: u64) -> PrepareRequest {
        PrepareRequest::Purchase {
            buyer: buyer.address(),
            publisher: publisher.to_string(),
            model_id: 1,
            price,
        }
    }

    async fn signed(p: &TransactionProtocol, kp: &AccountKeypair, request: PrepareRequest) -> SignedSubmission {
        let desc = p.prepare(request).await.unwrap();
        KeypairSigner::new(kp.clone()).sign(&desc).await.unwrap()
    }

    #[tokio::test]
    async fn matching_submission_passes() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let buyer = AccountKeypair::generate();
        let publisher = AccountKeypair::generate().address();
        let request = purchase(&buyer, &publisher, 500);

        let submission = signed(&p, &buyer, request.clone()).await;
        let members = p.check_submission(&request, &submission).unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn buyer_cannot_sign_a_cheaper_purchase() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let buyer = AccountKeypair::generate();
        let publisher = AccountKeypair::generate().address();
        let cheap = signed(&p, &buyer, purchase(&buyer, &publisher, 1)).await;

        match p.check_submission(&purchase(&buyer, &publisher, 500), &cheap) {
            Err(ProtocolError::Validation(reason)) => assert!(reason.contains("member 0"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn payment_to_another_account_is_refused() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let buyer = AccountKeypair::generate();
        let publisher = AccountKeypair::generate().address();
        let request = purchase(&buyer, &publisher, 500);

        let mut desc = p.prepare(request.clone()).await.unwrap();
        desc.transactions[0].body = TransactionBody::Payment {
            receiver: AccountKeypair::generate().address(),
            amount: 500,
        };
        assign_group(&mut desc.transactions);
        let submission = SignedSubmission::Group(
            desc.transactions
                .iter()
                .map(|t| sign_transaction(t, &buyer).to_bytes())
                .collect(),
        );
        assert!(matches!(
            p.check_submission(&request, &submission),
            Err(ProtocolError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_payment_is_refused() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let buyer = AccountKeypair::generate();
        let publisher = AccountKeypair::generate().address();
        let request = purchase(&buyer, &publisher, 500);

        let desc = p.prepare(request.clone()).await.unwrap();
        let create_only = SignedSubmission::Single(sign_transaction(&desc.transactions[1], &buyer).to_bytes());
        match p.check_submission(&request, &create_only) {
            Err(ProtocolError::Validation(reason)) => assert!(reason.contains("expects 2"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn members_from_different_groups_are_refused() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let buyer = AccountKeypair::generate();
        let publisher = AccountKeypair::generate().address();
        let request = purchase(&buyer, &publisher, 500);

        let a = p.prepare(request.clone()).await.unwrap();
        let b = p.prepare(request.clone()).await.unwrap();
        let mixed = SignedSubmission::Group(vec![
            sign_transaction(&a.transactions[0], &buyer).to_bytes(),
            sign_transaction(&b.transactions[1], &buyer).to_bytes(),
        ]);
        assert!(matches!(
            p.check_submission(&request, &mixed),
            Err(ProtocolError::Submission(_))
        ));
    }

    #[tokio::test]
    async fn register_for_another_cid_is_refused() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let kp = AccountKeypair::generate();
        let register = |cid: &str| PrepareRequest::Register {
            publisher: kp.address(),
            cid: cid.into(),
            license: "MIT".into(),
        };
        let other = signed(&p, &kp, register("QmOther")).await;
        assert!(matches!(
            p.check_submission(&register("QmMine"), &other),
            Err(ProtocolError::Validation(_))
        ));
        let mine = signed(&p, &kp, register("QmMine")).await;
        assert!(p.check_submission(&register("QmMine"), &mine).is_ok());
    }

    #[tokio::test]
    async fn name_calls_target_the_name_registry() {
        let p = protocol(Arc::new(ScriptedGateway::never()));
        let kp = AccountKeypair::generate();
        let desc = p
            .prepare(PrepareRequest::Name {
                sender: kp.address(),
                name: "smith.desci".into(),
                action: NameAction::Register {
                    cid: "QmName".into(),
                    price: 42,
                },
            })
            .await
            .unwrap();

        assert_eq!(desc.kind, TransactionKind::Name);
        assert!(desc.group_id.is_none());
        match &desc.transactions[0].body {
            TransactionBody::ApplicationCall { app_id, args, .. } => {
                assert_eq!(*app_id, p.config().name_registry_app_id);
                assert_eq!(args.len(), 4);
                assert_eq!(args[0], b"register");
                assert_eq!(args[1], b"smith.desci");
                assert_eq!(args[2], b"QmName");
                assert_eq!(args[3], itob(42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("smith.desci").is_ok());
        assert!(validate_name("quant-lab2.desci").is_ok());
        for bad in ["smith", ".desci", "Smith.desci", "-x.desci", "x-.desci", "a b.desci"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
        let long = format!("{}.desci", "a".repeat(MAX_NAME_LENGTH));
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn tracker_enforces_order() {
        let mut t = ConfirmationTracker::new();
        assert!(t.submitted("x").is_err());
        t.awaiting_signature().unwrap();
        t.submitted("x").unwrap();
        assert_eq!(t.tx_id(), Some("x"));

        let cancelled = ConfirmationResult::failed("x", ConfirmationFailure::Cancelled, 1);
        t.finish(&cancelled).unwrap();
        assert_eq!(t.phase(), TransactionPhase::Submitted);

        let timed_out = ConfirmationResult::failed("x", ConfirmationFailure::Timeout, 1);
        t.finish(&timed_out).unwrap();
        assert_eq!(t.phase(), TransactionPhase::TimedOut);
        assert!(t.finish(&timed_out).is_err());
    }
}
