//! Unsigned transaction construction via the builder pattern.
//!
//! [`TransactionBuilder`] produces an [`UnsignedTransaction`] with a
//! deterministic id derived from its contents. It never sees a private key.
//! Signing happens outside the core, in whatever wallet the user trusts.
//!
//! Grouped transactions (payment + escrow creation) are bound together by
//! [`assign_group`]: the group id is a domain-separated hash over the member
//! ids, stamped into every member before their ids are recomputed. The
//! ledger executes a group atomically or not at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{now, TransactionBody, TransactionKind};
use crate::config::TRANSACTION_VALIDITY_WINDOW;
use crate::crypto::hash::{domain_separated_hash_parts, sha256};
use crate::ledger::NetworkParams;

const GROUP_ID_CONTEXT: &str = "desci-market 2026 transaction group v1";

// ---------------------------------------------------------------------------
// UnsignedTransaction
// ---------------------------------------------------------------------------

/// One ledger transaction awaiting a signature.
///
/// `id = hex(sha256(sha256(signable_bytes)))`. The id covers every field
/// except itself, group membership included, so it is stable across
/// signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub id: String,
    pub sender: String,
    pub body: TransactionBody,
    pub fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub genesis_id: String,
    /// Hex group id, set for grouped submissions.
    pub group: Option<String>,
    pub note: Option<Vec<u8>>,
}

impl UnsignedTransaction {
    /// Canonical bytes covered by the signature and the id.
    ///
    /// Fixed-width big-endian integers and length-prefixed byte strings.
    /// Not serde: field order must never depend on a serializer.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(b"TX");
        put_bytes(&mut buf, self.sender.as_bytes());

        match &self.body {
            TransactionBody::Payment { receiver, amount } => {
                buf.push(0x01);
                put_bytes(&mut buf, receiver.as_bytes());
                buf.extend_from_slice(&amount.to_be_bytes());
            }
            TransactionBody::ApplicationCall {
                app_id,
                args,
                accounts,
            } => {
                buf.push(0x02);
                buf.extend_from_slice(&app_id.to_be_bytes());
                buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
                for arg in args {
                    put_bytes(&mut buf, arg);
                }
                buf.extend_from_slice(&(accounts.len() as u32).to_be_bytes());
                for account in accounts {
                    put_bytes(&mut buf, account.as_bytes());
                }
            }
        }

        buf.extend_from_slice(&self.fee.to_be_bytes());
        buf.extend_from_slice(&self.first_valid.to_be_bytes());
        buf.extend_from_slice(&self.last_valid.to_be_bytes());
        put_bytes(&mut buf, self.genesis_id.as_bytes());
        put_optional(&mut buf, self.group.as_deref().map(str::as_bytes));
        put_optional(&mut buf, self.note.as_deref());
        buf
    }

    pub fn compute_id(&self) -> String {
        hex::encode(sha256(&sha256(&self.signable_bytes())))
    }

    /// Id of this transaction as it was before group assignment.
    pub(crate) fn ungrouped_id(&self) -> String {
        let mut bare = self.clone();
        bare.group = None;
        bare.compute_id()
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_optional(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            buf.push(0x01);
            put_bytes(buf, b);
        }
        None => buf.push(0x00),
    }
}

/// Group id over member ids, in order.
pub fn compute_group_id(member_ids: &[String]) -> String {
    let parts: Vec<&[u8]> = member_ids.iter().map(|id| id.as_bytes()).collect();
    hex::encode(domain_separated_hash_parts(GROUP_ID_CONTEXT, &parts))
}

/// Bind `txns` into one atomic group. Returns the group id.
pub fn assign_group(txns: &mut [UnsignedTransaction]) -> String {
    let ids: Vec<String> = txns.iter().map(UnsignedTransaction::ungrouped_id).collect();
    let group = compute_group_id(&ids);
    for tx in txns.iter_mut() {
        tx.group = Some(group.clone());
        tx.id = tx.compute_id();
    }
    group
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// What `prepare` hands back to the caller: everything the wallet needs to
/// sign, and nothing secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransactionDescriptor {
    pub kind: TransactionKind,
    /// One transaction, or the members of a group in submission order.
    pub transactions: Vec<UnsignedTransaction>,
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UnsignedTransactionDescriptor {
    pub fn single(kind: TransactionKind, tx: UnsignedTransaction) -> Self {
        Self {
            kind,
            transactions: vec![tx],
            group_id: None,
            created_at: now(),
        }
    }

    pub fn group(kind: TransactionKind, mut txns: Vec<UnsignedTransaction>) -> Self {
        let group_id = assign_group(&mut txns);
        Self {
            kind,
            transactions: txns,
            group_id: Some(group_id),
            created_at: now(),
        }
    }

    /// Id the ledger will report for this submission (the first member).
    pub fn primary_id(&self) -> Option<&str> {
        self.transactions.first().map(|t| t.id.as_str())
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// TransactionBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`UnsignedTransaction`].
///
/// ```rust,no_run
/// use desci_protocol::transaction::TransactionBuilder;
///
/// let tx = TransactionBuilder::app_call("desci1publisher...", 1001)
///     .arg(b"publish".to_vec())
///     .arg(b"QmContentId".to_vec())
///     .validity(100, 1_100)
///     .fee(1_000)
///     .build();
/// ```
pub struct TransactionBuilder {
    sender: String,
    body: TransactionBody,
    fee: u64,
    first_valid: u64,
    last_valid: u64,
    genesis_id: String,
    note: Option<Vec<u8>>,
}

impl TransactionBuilder {
    pub fn payment(sender: &str, receiver: &str, amount: u64) -> Self {
        Self::from_body(
            sender,
            TransactionBody::Payment {
                receiver: receiver.to_string(),
                amount,
            },
        )
    }

    pub fn app_call(sender: &str, app_id: u64) -> Self {
        Self::from_body(
            sender,
            TransactionBody::ApplicationCall {
                app_id,
                args: Vec::new(),
                accounts: Vec::new(),
            },
        )
    }

    /// Start from an already assembled body.
    pub fn from_body(sender: &str, body: TransactionBody) -> Self {
        Self {
            sender: sender.to_string(),
            body,
            fee: 0,
            first_valid: 0,
            last_valid: TRANSACTION_VALIDITY_WINDOW,
            genesis_id: String::new(),
            note: None,
        }
    }

    /// Append an application argument. No-op on payments.
    pub fn arg(mut self, arg: Vec<u8>) -> Self {
        if let TransactionBody::ApplicationCall { args, .. } = &mut self.body {
            args.push(arg);
        }
        self
    }

    /// Append a referenced account. No-op on payments.
    pub fn account(mut self, address: &str) -> Self {
        if let TransactionBody::ApplicationCall { accounts, .. } = &mut self.body {
            accounts.push(address.to_string());
        }
        self
    }

    pub fn fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    pub fn validity(mut self, first_valid: u64, last_valid: u64) -> Self {
        self.first_valid = first_valid;
        self.last_valid = last_valid;
        self
    }

    pub fn genesis(mut self, genesis_id: &str) -> Self {
        self.genesis_id = genesis_id.to_string();
        self
    }

    pub fn note(mut self, note: Vec<u8>) -> Self {
        self.note = Some(note);
        self
    }

    /// Fee, validity window and genesis id from suggested params.
    pub fn params(self, params: &NetworkParams, window: u64) -> Self {
        let fee = params.fee.max(params.min_fee);
        self.fee(fee)
            .validity(params.last_round, params.last_round.saturating_add(window))
            .genesis(&params.genesis_id)
    }

    pub fn build(self) -> UnsignedTransaction {
        let mut tx = UnsignedTransaction {
            id: String::new(),
            sender: self.sender,
            body: self.body,
            fee: self.fee,
            first_valid: self.first_valid,
            last_valid: self.last_valid,
            genesis_id: self.genesis_id,
            group: None,
            note: self.note,
        };
        tx.id = tx.compute_id();
        tx
    }
}
