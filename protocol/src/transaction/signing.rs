//! The signing seam.
//!
//! The core prepares [`UnsignedTransactionDescriptor`]s and accepts signed
//! bytes back. What happens in between belongs to the user's wallet, behind
//! the [`TransactionSigner`] trait. [`KeypairSigner`] is the in-process
//! implementation used by devnet and the test suite.
//!
//! ## Wire format
//!
//! A signed transaction is `bincode(SignedTransaction)`. A submission is a
//! sequence of frames, each `u32 big-endian length || signed transaction`.
//! A single transaction is a one-frame submission; a group is one frame per
//! member, in group order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::builder::{UnsignedTransaction, UnsignedTransactionDescriptor};
use crate::crypto::keys::{AccountKeypair, AccountSignature};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("signer: {0}")]
pub struct SignerError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty submission")]
    Empty,

    #[error("truncated frame at byte {0}")]
    Truncated(usize),

    #[error("malformed signed transaction: {0}")]
    Malformed(String),
}

/// An unsigned transaction plus the sender's signature over its
/// signable bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: UnsignedTransaction,
    pub signature: AccountSignature,
}

impl SignedTransaction {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain derives over owned data; bincode cannot fail here.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    pub fn id(&self) -> &str {
        &self.transaction.id
    }
}

/// Externally signed bytes, as handed back by a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignedSubmission {
    Single(Vec<u8>),
    Group(Vec<Vec<u8>>),
}

impl SignedSubmission {
    /// Frame for `LedgerGateway::submit_raw`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            SignedSubmission::Single(tx) if tx.is_empty() => Err(FrameError::Empty),
            SignedSubmission::Single(tx) => Ok(encode_frames(std::slice::from_ref(tx))),
            SignedSubmission::Group(txs) if txs.is_empty() || txs.iter().any(Vec::is_empty) => {
                Err(FrameError::Empty)
            }
            SignedSubmission::Group(txs) => Ok(encode_frames(txs)),
        }
    }

    /// Decode every member, failing on the first malformed one.
    pub fn transactions(&self) -> Result<Vec<SignedTransaction>, FrameError> {
        match self {
            SignedSubmission::Single(tx) => Ok(vec![SignedTransaction::from_bytes(tx)?]),
            SignedSubmission::Group(txs) => txs.iter().map(|t| SignedTransaction::from_bytes(t)).collect(),
        }
    }
}

pub fn encode_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let total = frames.iter().map(|f| f.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

pub fn decode_frames(raw: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < raw.len() {
        let header = raw.get(pos..pos + 4).ok_or(FrameError::Truncated(pos))?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = pos + 4;
        let body = raw
            .get(start..start + len)
            .ok_or(FrameError::Truncated(start))?;
        frames.push(body.to_vec());
        pos = start + len;
    }
    Ok(frames)
}

/// Sign one transaction with a local keypair.
pub fn sign_transaction(tx: &UnsignedTransaction, keypair: &AccountKeypair) -> SignedTransaction {
    SignedTransaction {
        transaction: tx.clone(),
        signature: keypair.sign(&tx.signable_bytes()),
    }
}

/// Anything that can turn a descriptor into signed bytes: a browser
/// wallet bridge, a hardware signer, or a local keypair.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// The account this signer signs for.
    fn address(&self) -> String;

    async fn sign(
        &self,
        descriptor: &UnsignedTransactionDescriptor,
    ) -> Result<SignedSubmission, SignerError>;
}

/// Local Ed25519 signer. Refuses to sign for any account but its own.
#[derive(Debug, Clone)]
pub struct KeypairSigner {
    keypair: AccountKeypair,
}

impl KeypairSigner {
    pub fn new(keypair: AccountKeypair) -> Self {
        Self { keypair }
    }

    pub fn keypair(&self) -> &AccountKeypair {
        &self.keypair
    }
}

#[async_trait]
impl TransactionSigner for KeypairSigner {
    fn address(&self) -> String {
        self.keypair.address()
    }

    async fn sign(
        &self,
        descriptor: &UnsignedTransactionDescriptor,
    ) -> Result<SignedSubmission, SignerError> {
        let me = self.keypair.address();
        if let Some(foreign) = descriptor.transactions.iter().find(|t| t.sender != me) {
            return Err(SignerError(format!(
                "transaction {} is sent by {}, not {}",
                foreign.id, foreign.sender, me
            )));
        }

        let mut signed: Vec<Vec<u8>> = descriptor
            .transactions
            .iter()
            .map(|t| sign_transaction(t, &self.keypair).to_bytes())
            .collect();

        match (descriptor.is_group(), signed.len()) {
            (_, 0) => Err(SignerError("descriptor has no transactions".into())),
            (false, 1) => Ok(SignedSubmission::Single(signed.remove(0))),
            _ => Ok(SignedSubmission::Group(signed)),
        }
    }
}
