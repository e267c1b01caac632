//! Core transaction value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The marketplace operation a descriptor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Register a sealed model with the ModelRegistry program.
    Register,
    /// Grouped payment + escrow creation.
    Purchase,
    /// Publisher releases escrowed funds.
    Release,
    /// Buyer reclaims escrowed funds.
    Refund,
    /// A call on the NameRegistry program.
    Name,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Register => write!(f, "register"),
            TransactionKind::Purchase => write!(f, "purchase"),
            TransactionKind::Release => write!(f, "release"),
            TransactionKind::Refund => write!(f, "refund"),
            TransactionKind::Name => write!(f, "name"),
        }
    }
}

/// What a single ledger transaction does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionBody {
    Payment {
        receiver: String,
        amount: u64,
    },
    ApplicationCall {
        app_id: u64,
        args: Vec<Vec<u8>>,
        accounts: Vec<String>,
    },
}

/// Lifecycle of one prepare/confirm request.
///
/// ```text
/// Built ─▶ AwaitingSignature ─▶ Submitted ─┬─▶ Confirmed
///                                          ├─▶ TimedOut
///                                          └─▶ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    Built,
    AwaitingSignature,
    Submitted,
    Confirmed,
    TimedOut,
    Rejected,
}

impl TransactionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionPhase::Confirmed | TransactionPhase::TimedOut | TransactionPhase::Rejected
        )
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionPhase::Built => "built",
            TransactionPhase::AwaitingSignature => "awaiting_signature",
            TransactionPhase::Submitted => "submitted",
            TransactionPhase::Confirmed => "confirmed",
            TransactionPhase::TimedOut => "timed_out",
            TransactionPhase::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Encode an integer the way the on-chain programs do (`Itob`): 8 bytes,
/// big-endian.
pub fn itob(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode an `Itob` argument.
pub fn btoi(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
}

/// Timestamp helper for descriptors.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itob_is_big_endian() {
        assert_eq!(itob(1), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(btoi(&itob(42)), Some(42));
        assert_eq!(btoi(b"123"), None);
    }

    #[test]
    fn terminal_phases() {
        assert!(!TransactionPhase::Built.is_terminal());
        assert!(!TransactionPhase::Submitted.is_terminal());
        assert!(TransactionPhase::Confirmed.is_terminal());
        assert!(TransactionPhase::TimedOut.is_terminal());
        assert!(TransactionPhase::Rejected.is_terminal());
    }

    #[test]
    fn body_json_is_tagged() {
        let body = TransactionBody::Payment {
            receiver: "desci1abc".into(),
            amount: 5,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.starts_with("{\"payment\":"));
        assert_eq!(TransactionKind::Purchase.to_string(), "purchase");
    }
}
