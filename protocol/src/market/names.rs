//! `.desci` names.
//!
//! Same two-phase shape as the other flows: [`NameService::prepare`]
//! returns a descriptor for the sender to sign, and
//! [`NameService::submit`] takes the signed bytes back together with the
//! call they were signed for, checks that they match, and reads the
//! registry's answer out of the confirmed logs.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::MarketError;
use crate::config::{
    LOG_PREFIX_CID, LOG_PREFIX_DELETED, LOG_PREFIX_EXISTS, LOG_PREFIX_OWNER, LOG_PREFIX_PRICE, LOG_PREFIX_REGISTERED,
    LOG_PREFIX_ROUND, LOG_PREFIX_TRANSFERRED, LOG_PREFIX_UPDATED,
};
use crate::transaction::{
    extract_string, extract_u64, NameAction, PrepareRequest, ProtocolError, SignedSubmission, TransactionProtocol,
    TransactionSigner, UnsignedTransactionDescriptor,
};

/// One registry call: who sends it, on which name, doing what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameCall {
    pub sender: String,
    pub name: String,
    pub action: NameAction,
}

impl NameCall {
    fn request(&self) -> PrepareRequest {
        PrepareRequest::Name {
            sender: self.sender.clone(),
            name: self.name.clone(),
            action: self.action.clone(),
        }
    }
}

/// What the registry answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NameOutcome {
    Registered { owner: String },
    Resolved {
        owner: String,
        cid: String,
        price: u64,
        round: u64,
    },
    Updated,
    Transferred { new_owner: String },
    Deleted,
    Exists { exists: bool },
}

impl NameOutcome {
    /// Read the answer to `action` out of confirmed logs.
    pub fn from_logs(action: &NameAction, logs: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        let outcome = match action {
            NameAction::Register { .. } => NameOutcome::Registered {
                owner: after_name(&extract_string(logs, LOG_PREFIX_REGISTERED)?, LOG_PREFIX_REGISTERED)?,
            },
            NameAction::Resolve => NameOutcome::Resolved {
                owner: extract_string(logs, LOG_PREFIX_OWNER)?,
                cid: extract_string(logs, LOG_PREFIX_CID)?,
                price: extract_u64(logs, LOG_PREFIX_PRICE)?,
                round: extract_u64(logs, LOG_PREFIX_ROUND)?,
            },
            NameAction::Update { .. } => {
                extract_string(logs, LOG_PREFIX_UPDATED)?;
                NameOutcome::Updated
            }
            NameAction::Transfer { .. } => NameOutcome::Transferred {
                new_owner: after_name(&extract_string(logs, LOG_PREFIX_TRANSFERRED)?, LOG_PREFIX_TRANSFERRED)?,
            },
            NameAction::Delete => {
                extract_string(logs, LOG_PREFIX_DELETED)?;
                NameOutcome::Deleted
            }
            NameAction::Exists => {
                let flag = after_name(&extract_string(logs, LOG_PREFIX_EXISTS)?, LOG_PREFIX_EXISTS)?;
                NameOutcome::Exists { exists: flag == "1" }
            }
        };
        Ok(outcome)
    }
}

/// `name:value` with `name` free of colons.
fn after_name(line: &str, prefix: &str) -> Result<String, ProtocolError> {
    line.split_once(':')
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| ProtocolError::FieldAbsent(format!("{prefix} (malformed value)")))
}

/// A confirmed registry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameReceipt {
    pub name: String,
    pub tx_id: String,
    pub round: u64,
    #[serde(flatten)]
    pub outcome: NameOutcome,
}

pub struct NameService {
    protocol: Arc<TransactionProtocol>,
}

impl NameService {
    pub fn new(protocol: Arc<TransactionProtocol>) -> Self {
        Self { protocol }
    }

    pub async fn prepare(&self, call: &NameCall) -> Result<UnsignedTransactionDescriptor, MarketError> {
        Ok(self.protocol.prepare(call.request()).await?)
    }

    /// Submit `signed`, which must be exactly `call`, and wait for the
    /// registry's answer.
    pub async fn submit(
        &self,
        call: &NameCall,
        signed: &SignedSubmission,
        timeout: Duration,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<NameReceipt, MarketError> {
        match self.protocol.check_submission(&call.request(), signed) {
            Ok(_) => {}
            Err(ProtocolError::Validation(reason)) => return Err(MarketError::Validation(reason)),
            Err(e) => return Err(e.into()),
        }
        let tx_id = self.protocol.submit(signed).await?;
        let confirmed = self
            .protocol
            .confirm(&tx_id, timeout, cancel)
            .await
            .into_confirmed(timeout)?;
        let outcome = NameOutcome::from_logs(&call.action, &confirmed.logs)?;
        info!(
            name = %call.name,
            method = call.action.method(),
            round = confirmed.round,
            "name call confirmed"
        );
        Ok(NameReceipt {
            name: call.name.clone(),
            tx_id: confirmed.tx_id,
            round: confirmed.round,
            outcome,
        })
    }

    /// Prepare, sign with `signer` and submit.
    pub async fn call(
        &self,
        call: &NameCall,
        signer: &dyn TransactionSigner,
        timeout: Duration,
    ) -> Result<NameReceipt, MarketError> {
        let descriptor = self.prepare(call).await?;
        let signed = signer.sign(&descriptor).await.map_err(ProtocolError::from)?;
        self.submit(call, &signed, timeout, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::crypto::keys::AccountKeypair;
    use crate::ledger::{AccountInfo, GatewayError, LedgerGateway, NetworkParams, PendingInfo};
    use crate::transaction::{itob, KeypairSigner};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn line(prefix: &str, value: &[u8]) -> Vec<u8> {
        let mut l = prefix.as_bytes().to_vec();
        l.extend_from_slice(value);
        l
    }

    /// Confirms everything at round 100 with fixed logs.
    struct Echo {
        logs: Vec<Vec<u8>>,
        submits: AtomicU64,
    }

    #[async_trait]
    impl LedgerGateway for Echo {
        async fn get_params(&self) -> Result<NetworkParams, GatewayError> {
            Ok(NetworkParams {
                fee: 1_000,
                min_fee: 1_000,
                last_round: 99,
                genesis_id: "stub".into(),
            })
        }

        async fn submit_raw(&self, _raw: &[u8]) -> Result<String, GatewayError> {
            Ok(format!("tx-{}", self.submits.fetch_add(1, Ordering::SeqCst)))
        }

        async fn pending_info(&self, _tx_id: &str) -> Result<PendingInfo, GatewayError> {
            Ok(PendingInfo {
                confirmed_round: Some(100),
                pool_error: None,
                logs: self.logs.clone(),
            })
        }

        async fn account_info(&self, address: &str) -> Result<AccountInfo, GatewayError> {
            Ok(AccountInfo {
                address: address.into(),
                balance: 10_000_000,
                min_balance: 100_000,
            })
        }
    }

    fn service(logs: Vec<Vec<u8>>) -> (NameService, Arc<Echo>) {
        let echo = Arc::new(Echo {
            logs,
            submits: AtomicU64::new(0),
        });
        let config = ProtocolConfig {
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let protocol = Arc::new(TransactionProtocol::new(echo.clone(), config));
        (NameService::new(protocol), echo)
    }

    #[tokio::test]
    async fn resolve_reads_the_record() {
        let signer = KeypairSigner::new(AccountKeypair::generate());
        let (names, _) = service(vec![
            line(LOG_PREFIX_OWNER, b"desci1owner"),
            line(LOG_PREFIX_CID, b"QmLab"),
            line(LOG_PREFIX_PRICE, &itob(250)),
            line(LOG_PREFIX_ROUND, &itob(42)),
        ]);
        let call = NameCall {
            sender: signer.address(),
            name: "lab.desci".into(),
            action: NameAction::Resolve,
        };
        let receipt = names.call(&call, &signer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(receipt.round, 100);
        assert_eq!(
            receipt.outcome,
            NameOutcome::Resolved {
                owner: "desci1owner".into(),
                cid: "QmLab".into(),
                price: 250,
                round: 42,
            }
        );
    }

    #[tokio::test]
    async fn signed_call_must_match() {
        let signer = KeypairSigner::new(AccountKeypair::generate());
        let (names, echo) = service(vec![line(LOG_PREFIX_DELETED, b"lab.desci")]);
        let delete = NameCall {
            sender: signer.address(),
            name: "lab.desci".into(),
            action: NameAction::Delete,
        };
        let signed = signer.sign(&names.prepare(&delete).await.unwrap()).await.unwrap();

        let other = NameCall {
            name: "other.desci".into(),
            ..delete.clone()
        };
        let err = names
            .submit(&other, &signed, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)), "{err}");
        assert_eq!(echo.submits.load(Ordering::SeqCst), 0);

        let receipt = names.submit(&delete, &signed, Duration::from_secs(1), None).await.unwrap();
        assert_eq!(receipt.outcome, NameOutcome::Deleted);
    }

    #[test]
    fn outcomes_from_logs() {
        let registered = [line(LOG_PREFIX_REGISTERED, b"lab.desci:desci1owner")];
        assert_eq!(
            NameOutcome::from_logs(
                &NameAction::Register {
                    cid: "Qm".into(),
                    price: 1
                },
                &registered
            )
            .unwrap(),
            NameOutcome::Registered {
                owner: "desci1owner".into()
            }
        );

        let absent = [line(LOG_PREFIX_EXISTS, b"lab.desci:0")];
        assert_eq!(
            NameOutcome::from_logs(&NameAction::Exists, &absent).unwrap(),
            NameOutcome::Exists { exists: false }
        );

        assert!(matches!(
            NameOutcome::from_logs(&NameAction::Delete, &absent),
            Err(ProtocolError::FieldAbsent(_))
        ));
    }
}
