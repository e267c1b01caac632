//! Escrow records and the values the state machine hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where an escrow is in its life.
///
/// ```text
///            ┌──▶ Completed
/// Pending ───┼──▶ Refunded
///            └──▶ Failed
/// ```
///
/// Transitions are monotonic: nothing ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Pending,
    Completed,
    Refunded,
    Failed,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EscrowStatus::Pending)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscrowStatus::Pending => write!(f, "pending"),
            EscrowStatus::Completed => write!(f, "completed"),
            EscrowStatus::Refunded => write!(f, "refunded"),
            EscrowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for EscrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(EscrowStatus::Pending),
            "completed" => Ok(EscrowStatus::Completed),
            "refunded" => Ok(EscrowStatus::Refunded),
            "failed" => Ok(EscrowStatus::Failed),
            other => Err(format!("unknown escrow status '{other}'")),
        }
    }
}

/// One purchase's escrow, as tracked off-chain.
///
/// `encryption_key` is only ever set on a `Completed` escrow. Records are
/// never deleted; sweeps and failures mark them terminal instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowState {
    pub escrow_id: String,
    /// Chain-assigned model id.
    pub model_id: u64,
    pub buyer: String,
    pub publisher: String,
    pub price: u64,
    pub status: EscrowStatus,
    /// Id of the grouped payment + create submission.
    pub txn_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Hex symmetric key, released to the buyer on completion.
    pub encryption_key: Option<String>,
    /// Hex SHA-256 of the key. Known from the published model before
    /// completion, so a wrong key can be refused up front.
    pub encryption_key_hash: Option<String>,
    /// Escrow id assigned by the on-chain program (`EscrowID:` log).
    pub chain_escrow_id: Option<u64>,
    /// Round in which the purchase group was confirmed.
    pub payment_round: Option<u64>,
    /// Id of the release or refund transaction. Recorded as soon as the
    /// ledger accepts it, before confirmation.
    pub settlement_txn_id: Option<String>,
    pub settlement_round: Option<u64>,
    pub failure_reason: Option<String>,
    /// Set between a settlement's submission and its confirmation.
    pub settling: Option<SettlementInFlight>,
}

/// A release or refund the ledger accepted but has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementInFlight {
    /// Status the escrow takes once the transaction confirms.
    pub outcome: EscrowStatus,
    /// Hex key to record when a release confirms.
    pub key: Option<String>,
}

impl EscrowState {
    pub fn is_pending(&self) -> bool {
        self.status == EscrowStatus::Pending
    }

    /// Whether a release or refund is waiting for confirmation.
    pub fn is_settling(&self) -> bool {
        self.settling.is_some()
    }

    /// Whether the purchase payment has been seen in a confirmed round.
    pub fn is_funded(&self) -> bool {
        self.chain_escrow_id.is_some() && self.payment_round.is_some()
    }

    /// Age at `now`, clamped at zero for clocks that went backwards.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

/// Everything needed to open an escrow for a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub model_id: u64,
    pub buyer: String,
    pub publisher: String,
    pub price: u64,
    /// Key hash from the published model record, if known.
    #[serde(default)]
    pub encryption_key_hash: Option<String>,
}

/// Criteria for [`list_escrows`](super::EscrowStateMachine::list_escrows).
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowFilter {
    pub status: Option<EscrowStatus>,
    pub buyer: Option<String>,
    pub publisher: Option<String>,
    pub model_id: Option<u64>,
}

impl EscrowFilter {
    pub fn with_status(status: EscrowStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, escrow: &EscrowState) -> bool {
        self.status.map_or(true, |s| s == escrow.status)
            && self.buyer.as_deref().map_or(true, |b| b == escrow.buyer)
            && self.publisher.as_deref().map_or(true, |p| p == escrow.publisher)
            && self.model_id.map_or(true, |m| m == escrow.model_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowStatistics {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub refunded: usize,
    pub failed: usize,
    /// Sum of prices over completed escrows.
    pub settled_volume: u64,
}

impl EscrowStatistics {
    pub(crate) fn tally<'a>(escrows: impl IntoIterator<Item = &'a EscrowState>) -> Self {
        let mut stats = Self::default();
        for e in escrows {
            stats.total += 1;
            match e.status {
                EscrowStatus::Pending => stats.pending += 1,
                EscrowStatus::Completed => {
                    stats.completed += 1;
                    stats.settled_volume = stats.settled_volume.saturating_add(e.price);
                }
                EscrowStatus::Refunded => stats.refunded += 1,
                EscrowStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// The key handed to a buyer once their escrow completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasedKey {
    /// Hex symmetric key.
    Plain(String),
    /// Hex [`WrappedKey`](crate::crypto::hybrid::WrappedKey) for the
    /// buyer's X25519 public key.
    Wrapped(String),
}
