//! # Model Registry Program
//!
//! Assigns sequential ids to published models and remembers who published
//! what under which license. That's it. The artifact itself never touches
//! the chain; only its content id does.
//!
//! | Method    | Args                        | Logs                                  |
//! |-----------|-----------------------------|---------------------------------------|
//! | `publish` | `cid`, `license`            | `ModelID:`                            |
//! | `get`     | `itob(model_id)`            | `ModelID:` `CID:` `Publisher:` `License:` |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use desci_protocol::config::{LOG_PREFIX_CID, LOG_PREFIX_MODEL_ID};
use desci_protocol::transaction::{btoi, itob};

use crate::log_line;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("{method}: expected {expected} args, got {got}")]
    BadArity {
        method: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed model id argument")]
    BadModelId,

    #[error("model {0} does not exist")]
    UnknownModel(u64),

    #[error("content id is empty")]
    EmptyCid,
}

/// What the registry remembers about one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub model_id: u64,
    pub cid: String,
    pub publisher: String,
    pub license: String,
}

/// Registry program state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    model_count: u64,
    models: BTreeMap<u64, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_count(&self) -> u64 {
        self.model_count
    }

    pub fn get(&self, model_id: u64) -> Option<&RegisteredModel> {
        self.models.get(&model_id)
    }

    /// Dispatch an application call. Returns the log lines.
    pub fn call(&mut self, sender: &str, args: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, RegistryError> {
        match args.first().map(Vec::as_slice) {
            Some(b"publish") => self.publish(sender, args),
            Some(b"get") => self.get_logs(args),
            Some(other) => Err(RegistryError::UnknownMethod(String::from_utf8_lossy(other).into_owned())),
            None => Err(RegistryError::UnknownMethod(String::new())),
        }
    }

    fn publish(&mut self, sender: &str, args: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, RegistryError> {
        arity("publish", args, 3)?;
        let cid = String::from_utf8_lossy(&args[1]).into_owned();
        if cid.is_empty() {
            return Err(RegistryError::EmptyCid);
        }
        let model_id = self.model_count + 1;
        self.model_count = model_id;
        self.models.insert(
            model_id,
            RegisteredModel {
                model_id,
                cid,
                publisher: sender.to_string(),
                license: String::from_utf8_lossy(&args[2]).into_owned(),
            },
        );
        Ok(vec![log_line(LOG_PREFIX_MODEL_ID, &itob(model_id))])
    }

    fn get_logs(&self, args: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, RegistryError> {
        arity("get", args, 2)?;
        let model_id = btoi(&args[1]).ok_or(RegistryError::BadModelId)?;
        let model = self.models.get(&model_id).ok_or(RegistryError::UnknownModel(model_id))?;
        Ok(vec![
            log_line(LOG_PREFIX_MODEL_ID, &itob(model_id)),
            log_line(LOG_PREFIX_CID, model.cid.as_bytes()),
            log_line("Publisher:", model.publisher.as_bytes()),
            log_line("License:", model.license.as_bytes()),
        ])
    }
}

fn arity(method: &'static str, args: &[Vec<u8>], expected: usize) -> Result<(), RegistryError> {
    if args.len() != expected {
        return Err(RegistryError::BadArity {
            method,
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use desci_protocol::transaction::extract_u64;

    fn publish_args(cid: &str) -> Vec<Vec<u8>> {
        vec![b"publish".to_vec(), cid.as_bytes().to_vec(), b"MIT".to_vec()]
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let mut registry = ModelRegistry::new();
        let first = registry.call("desci1alice", &publish_args("cid-a")).unwrap();
        let second = registry.call("desci1bob", &publish_args("cid-b")).unwrap();

        assert_eq!(extract_u64(&first, LOG_PREFIX_MODEL_ID).unwrap(), 1);
        assert_eq!(extract_u64(&second, LOG_PREFIX_MODEL_ID).unwrap(), 2);
        assert_eq!(registry.model_count(), 2);
        assert_eq!(registry.get(2).unwrap().publisher, "desci1bob");
    }

    #[test]
    fn get_logs_the_record() {
        let mut registry = ModelRegistry::new();
        registry.call("desci1alice", &publish_args("cid-a")).unwrap();
        let logs = registry.call("desci1anyone", &[b"get".to_vec(), itob(1)]).unwrap();
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[1], b"CID:cid-a".to_vec());
        assert_eq!(logs[3], b"License:MIT".to_vec());
    }

    #[test]
    fn rejects_garbage() {
        let mut registry = ModelRegistry::new();
        assert!(matches!(
            registry.call("x", &[b"delete".to_vec()]),
            Err(RegistryError::UnknownMethod(_))
        ));
        assert!(matches!(
            registry.call("x", &[b"publish".to_vec()]),
            Err(RegistryError::BadArity { .. })
        ));
        assert_eq!(registry.call("x", &publish_args("")), Err(RegistryError::EmptyCid));
        assert_eq!(
            registry.call("x", &[b"get".to_vec(), itob(9)]),
            Err(RegistryError::UnknownModel(9))
        );
        assert_eq!(registry.model_count(), 0);
    }
}
