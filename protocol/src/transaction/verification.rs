//! Structural and cryptographic checks on signed transactions.
//!
//! Run by whoever accepts signed bytes before acting on them: the
//! simulated ledger does it on every submission, and the protocol runs the
//! cheap structural subset before it bothers the gateway. Checks go from
//! cheapest to most expensive.

use thiserror::Error;

use super::builder::{compute_group_id, UnsignedTransaction};
use super::signing::SignedTransaction;
use super::types::TransactionBody;
use crate::crypto::keys::{is_valid_address, verify_signature};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction ID mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("invalid sender address: {0}")]
    InvalidSender(String),

    #[error("invalid receiver address: {0}")]
    InvalidReceiver(String),

    #[error("payment amount must be > 0")]
    ZeroAmount,

    #[error("sender and receiver must differ: both are {0}")]
    SelfPayment(String),

    #[error("invalid validity window [{first_valid}, {last_valid}]")]
    InvalidWindow { first_valid: u64, last_valid: u64 },

    #[error("invalid signature for sender {0}")]
    InvalidSignature(String),

    #[error("group mismatch: {0}")]
    GroupMismatch(String),
}

/// Field-level checks that need no key material.
pub fn verify_structure(tx: &UnsignedTransaction) -> Result<(), TransactionError> {
    if tx.first_valid > tx.last_valid {
        return Err(TransactionError::InvalidWindow {
            first_valid: tx.first_valid,
            last_valid: tx.last_valid,
        });
    }

    if let TransactionBody::Payment { receiver, amount } = &tx.body {
        if *amount == 0 {
            return Err(TransactionError::ZeroAmount);
        }
        if receiver == &tx.sender {
            return Err(TransactionError::SelfPayment(receiver.clone()));
        }
        if !is_valid_address(receiver) {
            return Err(TransactionError::InvalidReceiver(receiver.clone()));
        }
    }

    if !is_valid_address(&tx.sender) {
        return Err(TransactionError::InvalidSender(tx.sender.clone()));
    }

    let expected = tx.compute_id();
    if tx.id != expected {
        return Err(TransactionError::IdMismatch {
            expected,
            actual: tx.id.clone(),
        });
    }
    Ok(())
}

/// Structure plus the Ed25519 signature against the sender address.
pub fn verify_signed(signed: &SignedTransaction) -> Result<(), TransactionError> {
    let tx = &signed.transaction;
    verify_structure(tx)?;
    if !verify_signature(&tx.sender, &tx.signable_bytes(), &signed.signature) {
        return Err(TransactionError::InvalidSignature(tx.sender.clone()));
    }
    Ok(())
}

/// Every member verifies, and for groups of more than one, every member
/// carries the same group id and that id matches the members.
pub fn verify_group(members: &[SignedTransaction]) -> Result<(), TransactionError> {
    for m in members {
        verify_signed(m)?;
    }
    if members.len() < 2 {
        return Ok(());
    }

    let group = members[0]
        .transaction
        .group
        .clone()
        .ok_or_else(|| TransactionError::GroupMismatch("first member has no group id".into()))?;
    if members.iter().any(|m| m.transaction.group.as_deref() != Some(group.as_str())) {
        return Err(TransactionError::GroupMismatch("members disagree on group id".into()));
    }

    let ids: Vec<String> = members.iter().map(|m| m.transaction.ungrouped_id()).collect();
    let expected = compute_group_id(&ids);
    if expected != group {
        return Err(TransactionError::GroupMismatch(format!(
            "group id {group} does not match members (expected {expected})"
        )));
    }
    Ok(())
}
