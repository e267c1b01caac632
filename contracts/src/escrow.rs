//! # Escrow Program
//!
//! Holds a buyer's payment until the publisher releases it or the buyer
//! takes it back. One program instance holds any number of escrows, keyed
//! by a sequential id it hands out at creation.
//!
//! ## Lifecycle
//!
//! 1. **Create**: the buyer sends a group: a payment of at least `price`
//!    to the program's address, then `create(model_id, price)` naming the
//!    publisher. Logs `EscrowID:`.
//! 2. **Release**: only the publisher, only while pending. Pays the
//!    publisher from the program's account.
//! 3. **Refund**: only the buyer, only while pending. Pays the buyer back.
//!
//! Status codes on the wire are `0` pending, `1` completed, `2` refunded.
//! Nothing leaves a non-pending status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use desci_protocol::config::{LOG_PREFIX_ESCROW_ID, LOG_PREFIX_MODEL_ID, LOG_PREFIX_STATUS};
use desci_protocol::transaction::{btoi, itob};

use crate::log_line;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowProgramError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("{method}: expected {expected} args, got {got}")]
    BadArity {
        method: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed integer argument")]
    BadInteger,

    #[error("create needs the publisher in accounts")]
    MissingPublisher,

    #[error("create must be grouped after a payment to the escrow account")]
    MissingPayment,

    #[error("payment of {paid} does not cover price {price}")]
    Underpaid { paid: u64, price: u64 },

    #[error("price must be > 0")]
    ZeroPrice,

    #[error("escrow {0} does not exist")]
    UnknownEscrow(u64),

    #[error("escrow {escrow_id} is {status}, not pending")]
    NotPending { escrow_id: u64, status: ChainEscrowStatus },

    #[error("sender is not the escrow's {0}")]
    Unauthorized(&'static str),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEscrowStatus {
    Pending,
    Completed,
    Refunded,
}

impl ChainEscrowStatus {
    pub fn code(self) -> u64 {
        match self {
            ChainEscrowStatus::Pending => 0,
            ChainEscrowStatus::Completed => 1,
            ChainEscrowStatus::Refunded => 2,
        }
    }
}

impl fmt::Display for ChainEscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEscrowStatus::Pending => write!(f, "Pending"),
            ChainEscrowStatus::Completed => write!(f, "Completed"),
            ChainEscrowStatus::Refunded => write!(f, "Refunded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEscrow {
    pub escrow_id: u64,
    pub model_id: u64,
    pub buyer: String,
    pub publisher: String,
    pub price: u64,
    pub status: ChainEscrowStatus,
}

/// A payment that precedes the call in its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPayment {
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
}

/// One application call as the program sees it.
#[derive(Debug, Clone, Copy)]
pub struct EscrowCall<'a> {
    pub sender: &'a str,
    pub args: &'a [Vec<u8>],
    pub accounts: &'a [String],
    /// The payment immediately before this call in the same group.
    pub payment: Option<&'a GroupPayment>,
}

/// An inner payment out of the program's account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub receiver: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallEffects {
    pub logs: Vec<Vec<u8>>,
    pub payout: Option<Payout>,
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowProgram {
    /// Account the escrowed payments go to.
    address: String,
    next_id: u64,
    escrows: BTreeMap<u64, ChainEscrow>,
}

impl EscrowProgram {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            next_id: 1,
            escrows: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn get(&self, escrow_id: u64) -> Option<&ChainEscrow> {
        self.escrows.get(&escrow_id)
    }

    pub fn call(&mut self, call: EscrowCall<'_>) -> Result<CallEffects, EscrowProgramError> {
        match call.args.first().map(Vec::as_slice) {
            Some(b"create") => self.create(call),
            Some(b"release") => self.settle(call, ChainEscrowStatus::Completed),
            Some(b"refund") => self.settle(call, ChainEscrowStatus::Refunded),
            Some(b"status") => self.status(call),
            Some(other) => Err(EscrowProgramError::UnknownMethod(
                String::from_utf8_lossy(other).into_owned(),
            )),
            None => Err(EscrowProgramError::UnknownMethod(String::new())),
        }
    }

    fn create(&mut self, call: EscrowCall<'_>) -> Result<CallEffects, EscrowProgramError> {
        arity("create", call.args, 3)?;
        let model_id = int_arg(&call.args[1])?;
        let price = int_arg(&call.args[2])?;
        if price == 0 {
            return Err(EscrowProgramError::ZeroPrice);
        }
        let publisher = call.accounts.first().ok_or(EscrowProgramError::MissingPublisher)?;

        let payment = call
            .payment
            .filter(|p| p.sender == call.sender && p.receiver == self.address)
            .ok_or(EscrowProgramError::MissingPayment)?;
        if payment.amount < price {
            return Err(EscrowProgramError::Underpaid {
                paid: payment.amount,
                price,
            });
        }

        let escrow_id = self.next_id;
        self.next_id += 1;
        self.escrows.insert(
            escrow_id,
            ChainEscrow {
                escrow_id,
                model_id,
                buyer: call.sender.to_string(),
                publisher: publisher.clone(),
                price,
                status: ChainEscrowStatus::Pending,
            },
        );
        Ok(CallEffects {
            logs: vec![log_line(LOG_PREFIX_ESCROW_ID, &itob(escrow_id))],
            payout: None,
        })
    }

    fn settle(&mut self, call: EscrowCall<'_>, outcome: ChainEscrowStatus) -> Result<CallEffects, EscrowProgramError> {
        let method = if outcome == ChainEscrowStatus::Completed { "release" } else { "refund" };
        arity(method, call.args, 2)?;
        let escrow_id = int_arg(&call.args[1])?;
        let escrow = self
            .escrows
            .get_mut(&escrow_id)
            .ok_or(EscrowProgramError::UnknownEscrow(escrow_id))?;
        if escrow.status != ChainEscrowStatus::Pending {
            return Err(EscrowProgramError::NotPending {
                escrow_id,
                status: escrow.status,
            });
        }

        let receiver = match outcome {
            ChainEscrowStatus::Completed if call.sender == escrow.publisher => escrow.publisher.clone(),
            ChainEscrowStatus::Completed => return Err(EscrowProgramError::Unauthorized("publisher")),
            _ if call.sender == escrow.buyer => escrow.buyer.clone(),
            _ => return Err(EscrowProgramError::Unauthorized("buyer")),
        };

        escrow.status = outcome;
        Ok(CallEffects {
            logs: vec![log_line(LOG_PREFIX_STATUS, &itob(outcome.code()))],
            payout: Some(Payout {
                receiver,
                amount: escrow.price,
            }),
        })
    }

    fn status(&self, call: EscrowCall<'_>) -> Result<CallEffects, EscrowProgramError> {
        arity("status", call.args, 2)?;
        let escrow_id = int_arg(&call.args[1])?;
        let escrow = self
            .escrows
            .get(&escrow_id)
            .ok_or(EscrowProgramError::UnknownEscrow(escrow_id))?;
        Ok(CallEffects {
            logs: vec![
                log_line(LOG_PREFIX_MODEL_ID, &itob(escrow.model_id)),
                log_line("Buyer:", escrow.buyer.as_bytes()),
                log_line("Price:", &itob(escrow.price)),
                log_line(LOG_PREFIX_STATUS, &itob(escrow.status.code())),
                log_line("Publisher:", escrow.publisher.as_bytes()),
            ],
            payout: None,
        })
    }
}

fn arity(method: &'static str, args: &[Vec<u8>], expected: usize) -> Result<(), EscrowProgramError> {
    if args.len() != expected {
        return Err(EscrowProgramError::BadArity {
            method,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn int_arg(bytes: &[u8]) -> Result<u64, EscrowProgramError> {
    btoi(bytes).ok_or(EscrowProgramError::BadInteger)
}
