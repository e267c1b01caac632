//! # Simulated Ledger
//!
//! An in-process [`LedgerGateway`] that actually runs the three programs.
//! It verifies signatures and groups the way a real node would, executes
//! each submission atomically against account balances, and confirms it
//! one block at a time as it gets polled.
//!
//! Good enough for devnet and for tests that want the whole
//! publish → purchase → release path without a network. Knobs for the
//! unhappy paths:
//!
//! - [`set_stalled`](SimulatedLedger::set_stalled): nothing confirms.
//! - [`evict_next`](SimulatedLedger::evict_next): the next submission is
//!   accepted, then dropped from the pool with a reason.
//! - [`calls`](SimulatedLedger::calls): how many times the gateway was hit.
//!
//! Rounds advance only when a transaction confirms. With the default
//! start round of 99 the first confirmation lands in round 100.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

use desci_protocol::config::{
    ProtocolConfig, DEFAULT_ESCROW_APP_ID, DEFAULT_NAME_REGISTRY_APP_ID, DEFAULT_REGISTRY_APP_ID, MIN_TRANSACTION_FEE,
};
use desci_protocol::crypto::hash::domain_separated_hash;
use desci_protocol::crypto::keys::address_from_public_key;
use desci_protocol::ledger::{AccountInfo, GatewayError, LedgerGateway, NetworkParams, PendingInfo};
use desci_protocol::transaction::{decode_frames, verify_group, SignedTransaction, TransactionBody};

use crate::escrow::{ChainEscrow, EscrowCall, EscrowProgram, GroupPayment};
use crate::model_registry::{ModelRegistry, RegisteredModel};
use crate::name_registry::{NameRecord, NameRegistry};

const APP_ACCOUNT_CONTEXT: &str = "desci-market 2026 app account v1";

/// Address of the account an application holds funds in.
pub fn application_address(app_id: u64) -> String {
    address_from_public_key(&domain_separated_hash(APP_ACCOUNT_CONTEXT, &app_id.to_be_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedLedgerConfig {
    pub genesis_id: String,
    /// Round reported before anything has confirmed.
    pub start_round: u64,
    pub fee: u64,
    pub min_fee: u64,
    /// Floor every user account must keep.
    pub min_balance: u64,
    /// Polls a transaction sits in the pool before it confirms. 1 means the
    /// first poll sees it confirmed.
    pub confirm_after_polls: u32,
    pub registry_app_id: u64,
    pub escrow_app_id: u64,
    pub name_registry_app_id: u64,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            genesis_id: "desci-devnet-v1".into(),
            start_round: 99,
            fee: MIN_TRANSACTION_FEE,
            min_fee: MIN_TRANSACTION_FEE,
            min_balance: 100_000,
            confirm_after_polls: 1,
            registry_app_id: DEFAULT_REGISTRY_APP_ID,
            escrow_app_id: DEFAULT_ESCROW_APP_ID,
            name_registry_app_id: DEFAULT_NAME_REGISTRY_APP_ID,
        }
    }
}

/// World state that a submission mutates. Cloned per submission so a
/// failing member leaves no trace.
#[derive(Debug, Clone)]
struct WorldState {
    balances: HashMap<String, u64>,
    registry: ModelRegistry,
    escrow: EscrowProgram,
    names: NameRegistry,
}

#[derive(Debug, Default)]
struct PoolEntry {
    logs: Vec<Vec<u8>>,
    polls: u32,
    confirmed_round: Option<u64>,
    pool_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    round: u64,
    world: WorldState,
    pool: HashMap<String, PoolEntry>,
    evict_next: Option<String>,
}

pub struct SimulatedLedger {
    config: SimulatedLedgerConfig,
    inner: Mutex<Inner>,
    stalled: AtomicBool,
    calls: AtomicU64,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let escrow = EscrowProgram::new(application_address(config.escrow_app_id));
        Self {
            inner: Mutex::new(Inner {
                round: config.start_round,
                world: WorldState {
                    balances: HashMap::new(),
                    registry: ModelRegistry::new(),
                    escrow,
                    names: NameRegistry::new(),
                },
                pool: HashMap::new(),
                evict_next: None,
            }),
            config,
            stalled: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn devnet() -> Self {
        Self::new(SimulatedLedgerConfig::default())
    }

    pub fn config(&self) -> &SimulatedLedgerConfig {
        &self.config
    }

    pub fn escrow_address(&self) -> String {
        application_address(self.config.escrow_app_id)
    }

    /// Protocol settings that point at this ledger's programs.
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            registry_app_id: self.config.registry_app_id,
            escrow_app_id: self.config.escrow_app_id,
            escrow_address: self.escrow_address(),
            name_registry_app_id: self.config.name_registry_app_id,
            ..Default::default()
        }
    }

    /// Credit `amount` to `address` out of thin air.
    pub fn fund(&self, address: &str, amount: u64) {
        let mut inner = self.inner.lock();
        let balance = inner.world.balances.entry(address.to_string()).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.inner.lock().world.balances.get(address).copied().unwrap_or(0)
    }

    pub fn round(&self) -> u64 {
        self.inner.lock().round
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Accept the next submission, then evict it from the pool with
    /// `reason` instead of confirming it. Its effects are never applied.
    pub fn evict_next(&self, reason: impl Into<String>) {
        self.inner.lock().evict_next = Some(reason.into());
    }

    /// Total gateway calls served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn registered_model(&self, model_id: u64) -> Option<RegisteredModel> {
        self.inner.lock().world.registry.get(model_id).cloned()
    }

    pub fn chain_escrow(&self, escrow_id: u64) -> Option<ChainEscrow> {
        self.inner.lock().world.escrow.get(escrow_id).cloned()
    }

    pub fn name_record(&self, name: &str) -> Option<NameRecord> {
        self.inner.lock().world.names.get(name).cloned()
    }

    fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Check the envelope of each member against the current round.
    fn admit(&self, round: u64, members: &[SignedTransaction]) -> Result<(), String> {
        let next = round + 1;
        for m in members {
            let tx = &m.transaction;
            if tx.genesis_id != self.config.genesis_id {
                return Err(format!("transaction {} is for genesis '{}'", tx.id, tx.genesis_id));
            }
            if tx.fee < self.config.min_fee {
                return Err(format!("transaction {} fee {} below minimum {}", tx.id, tx.fee, self.config.min_fee));
            }
            if next < tx.first_valid || next > tx.last_valid {
                return Err(format!(
                    "transaction {} valid in [{}, {}], current round {next}",
                    tx.id, tx.first_valid, tx.last_valid
                ));
            }
        }
        Ok(())
    }

    /// Run every member against `world` as if confirmed in `round`. Any
    /// error aborts the lot.
    fn execute(
        &self,
        world: &mut WorldState,
        round: u64,
        members: &[SignedTransaction],
    ) -> Result<Vec<Vec<u8>>, String> {
        let mut logs = Vec::new();
        let mut previous_payment: Option<GroupPayment> = None;

        for m in members {
            let tx = &m.transaction;
            match &tx.body {
                TransactionBody::Payment { receiver, amount } => {
                    let total = amount.checked_add(tx.fee).ok_or("amount overflow")?;
                    debit(&mut world.balances, &tx.sender, total, self.config.min_balance)?;
                    credit(&mut world.balances, receiver, *amount);
                    previous_payment = Some(GroupPayment {
                        sender: tx.sender.clone(),
                        receiver: receiver.clone(),
                        amount: *amount,
                    });
                }
                TransactionBody::ApplicationCall {
                    app_id,
                    args,
                    accounts,
                } => {
                    debit(&mut world.balances, &tx.sender, tx.fee, self.config.min_balance)?;
                    if *app_id == self.config.registry_app_id {
                        logs.extend(world.registry.call(&tx.sender, args).map_err(|e| e.to_string())?);
                    } else if *app_id == self.config.name_registry_app_id {
                        logs.extend(world.names.call(&tx.sender, args, round).map_err(|e| e.to_string())?);
                    } else if *app_id == self.config.escrow_app_id {
                        let effects = world
                            .escrow
                            .call(EscrowCall {
                                sender: &tx.sender,
                                args,
                                accounts,
                                payment: previous_payment.as_ref(),
                            })
                            .map_err(|e| e.to_string())?;
                        if let Some(payout) = effects.payout {
                            let app = world.escrow.address().to_string();
                            debit(&mut world.balances, &app, payout.amount, 0)?;
                            credit(&mut world.balances, &payout.receiver, payout.amount);
                        }
                        logs.extend(effects.logs);
                    } else {
                        return Err(format!("application {app_id} does not exist"));
                    }
                    previous_payment = None;
                }
            }
        }
        Ok(logs)
    }
}

fn debit(balances: &mut HashMap<String, u64>, address: &str, amount: u64, floor: u64) -> Result<(), String> {
    let balance = balances.get(address).copied().unwrap_or(0);
    match balance.checked_sub(amount) {
        Some(rest) if rest >= floor => {
            balances.insert(address.to_string(), rest);
            Ok(())
        }
        _ => Err(format!(
            "overspend: {address} has {balance}, needs {amount} plus a floor of {floor}"
        )),
    }
}

fn credit(balances: &mut HashMap<String, u64>, address: &str, amount: u64) {
    let balance = balances.entry(address.to_string()).or_insert(0);
    *balance = balance.saturating_add(amount);
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn get_params(&self) -> Result<NetworkParams, GatewayError> {
        self.count_call();
        Ok(NetworkParams {
            fee: self.config.fee,
            min_fee: self.config.min_fee,
            last_round: self.round(),
            genesis_id: self.config.genesis_id.clone(),
        })
    }

    async fn submit_raw(&self, raw: &[u8]) -> Result<String, GatewayError> {
        self.count_call();
        let frames = decode_frames(raw).map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let members: Vec<SignedTransaction> = frames
            .iter()
            .map(|f| SignedTransaction::from_bytes(f))
            .collect::<Result<_, _>>()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        verify_group(&members).map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let id = members[0].id().to_string();

        let mut inner = self.inner.lock();
        if members.iter().any(|m| inner.pool.contains_key(m.id())) {
            return Err(GatewayError::Rejected(format!("transaction {id} already submitted")));
        }
        self.admit(inner.round, &members).map_err(GatewayError::Rejected)?;

        if let Some(reason) = inner.evict_next.take() {
            warn!(tx_id = %id, reason = %reason, "transaction will be evicted");
            inner.pool.insert(
                id.clone(),
                PoolEntry {
                    pool_error: Some(reason),
                    ..Default::default()
                },
            );
            return Ok(id);
        }

        let mut world = inner.world.clone();
        let logs = match self.execute(&mut world, inner.round + 1, &members) {
            Ok(logs) => logs,
            Err(reason) => {
                warn!(tx_id = %id, reason = %reason, "submission rejected");
                return Err(GatewayError::Rejected(reason));
            }
        };
        inner.world = world;
        inner.pool.insert(
            id.clone(),
            PoolEntry {
                logs,
                ..Default::default()
            },
        );
        debug!(tx_id = %id, members = members.len(), "submission accepted");
        Ok(id)
    }

    async fn pending_info(&self, tx_id: &str) -> Result<PendingInfo, GatewayError> {
        self.count_call();
        let stalled = self.stalled.load(Ordering::SeqCst);
        let mut inner = self.inner.lock();
        let Inner { round, pool, .. } = &mut *inner;
        let entry = pool
            .get_mut(tx_id)
            .ok_or_else(|| GatewayError::NotFound(tx_id.to_string()))?;

        if entry.pool_error.is_some() {
            return Ok(PendingInfo {
                pool_error: entry.pool_error.clone(),
                ..Default::default()
            });
        }
        if entry.confirmed_round.is_none() && !stalled {
            entry.polls += 1;
            if entry.polls >= self.config.confirm_after_polls {
                *round += 1;
                entry.confirmed_round = Some(*round);
                debug!(tx_id, round = *round, "transaction confirmed");
            }
        }
        Ok(PendingInfo {
            confirmed_round: entry.confirmed_round,
            pool_error: None,
            logs: if entry.confirmed_round.is_some() {
                entry.logs.clone()
            } else {
                Vec::new()
            },
        })
    }

    async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError> {
        self.count_call();
        Ok(AccountInfo {
            address: address.to_string(),
            balance: self.balance(address),
            min_balance: self.config.min_balance,
        })
    }
}
