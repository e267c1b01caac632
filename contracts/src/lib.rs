// Copyright (c) 2026 DeSciChain Contributors. MIT License.
// See LICENSE for details.

//! # DeSci Marketplace Programs
//!
//! The on-chain half of the marketplace, written as plain Rust state
//! machines, plus a ledger that runs them in process:
//!
//! - **Model Registry**: sequential model ids, content ids, licenses.
//! - **Escrow**: holds a buyer's payment until the publisher releases it
//!   or the buyer takes it back.
//! - **Name Registry**: `.desci` names owned by accounts, each pointing
//!   at a content id and a price.
//! - **Simulated Ledger**: a [`LedgerGateway`](desci_protocol::ledger::LedgerGateway)
//!   that verifies signatures, executes groups atomically and confirms
//!   one round at a time. Devnet and the integration tests run on it.
//!
//! ## Design Principles
//!
//! 1. Every monetary step uses checked arithmetic. Money doesn't wrap.
//! 2. State transitions are explicit enum variants, not boolean flags.
//! 3. The sender is the only authority. No admin keys, no overrides.
//! 4. Programs report results in log lines, `prefix || value`, so the
//!    core can read them back without knowing anything about the chain.

pub mod escrow;
pub mod ledger;
pub mod model_registry;
pub mod name_registry;

pub use ledger::{application_address, SimulatedLedger, SimulatedLedgerConfig};

/// One program log line: `prefix || value`.
pub(crate) fn log_line(prefix: &str, value: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(prefix.len() + value.len());
    line.extend_from_slice(prefix.as_bytes());
    line.extend_from_slice(value);
    line
}
