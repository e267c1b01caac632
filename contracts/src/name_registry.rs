//! # Name Registry Program
//!
//! Human-readable names (`smith.desci`) for accounts, each pointing at a
//! content id and a price. The sender of `register` owns the name; only
//! the owner may update, transfer or delete it.
//!
//! | Method     | Args                           | Logs                                        |
//! |------------|--------------------------------|---------------------------------------------|
//! | `register` | `name`, `cid`, `itob(price)`   | `REGISTERED:name:owner`                     |
//! | `resolve`  | `name`                         | `OWNER:` `CID:` `PRICE:` `ROUND:`           |
//! | `update`   | `name`, `cid`, `itob(price)`   | `UPDATED:name`                              |
//! | `transfer` | `name`, `new_owner`            | `TRANSFERRED:name:new_owner`                |
//! | `delete`   | `name`                         | `DELETED:name`                              |
//! | `exists`   | `name`                         | `EXISTS:name:1` or `EXISTS:name:0`          |
//!
//! `ROUND:` is the round of the last write to the record. The program
//! itself only bounds a name's length; the `.desci` naming rules are
//! enforced where requests are prepared.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use desci_protocol::config::{
    LOG_PREFIX_CID, LOG_PREFIX_DELETED, LOG_PREFIX_EXISTS, LOG_PREFIX_OWNER, LOG_PREFIX_PRICE, LOG_PREFIX_REGISTERED,
    LOG_PREFIX_ROUND, LOG_PREFIX_TRANSFERRED, LOG_PREFIX_UPDATED, MAX_NAME_LENGTH,
};
use desci_protocol::crypto::keys::is_valid_address;
use desci_protocol::transaction::{btoi, itob};

use crate::log_line;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameRegistryError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("{method}: expected {expected} args, got {got}")]
    BadArity {
        method: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("name must be 1 to 64 bytes")]
    BadName,

    #[error("content id is empty")]
    EmptyCid,

    #[error("malformed price argument")]
    BadPrice,

    #[error("invalid new owner address")]
    BadOwner,

    #[error("name '{0}' is already registered")]
    Taken(String),

    #[error("name '{0}' is not registered")]
    UnknownName(String),

    #[error("{sender} does not own '{name}'")]
    NotOwner { name: String, sender: String },
}

/// What the registry keeps per name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub owner: String,
    pub cid: String,
    pub price: u64,
    /// Round of the last register, update or transfer.
    pub round: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameRegistry {
    names: BTreeMap<String, NameRecord>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&NameRecord> {
        self.names.get(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Dispatch an application call executed in `round`. Returns the log
    /// lines.
    pub fn call(&mut self, sender: &str, args: &[Vec<u8>], round: u64) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        let method = match args.first().map(Vec::as_slice) {
            Some(b"register") => "register",
            Some(b"resolve") => "resolve",
            Some(b"update") => "update",
            Some(b"transfer") => "transfer",
            Some(b"delete") => "delete",
            Some(b"exists") => "exists",
            Some(other) => {
                return Err(NameRegistryError::UnknownMethod(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
            None => return Err(NameRegistryError::UnknownMethod(String::new())),
        };
        let expected = match method {
            "register" | "update" => 4,
            "transfer" => 3,
            _ => 2,
        };
        if args.len() != expected {
            return Err(NameRegistryError::BadArity {
                method,
                expected,
                got: args.len(),
            });
        }
        if args[1].is_empty() || args[1].len() > MAX_NAME_LENGTH {
            return Err(NameRegistryError::BadName);
        }
        let name = String::from_utf8_lossy(&args[1]).into_owned();

        match method {
            "register" => self.register(sender, name, &args[2], &args[3], round),
            "resolve" => self.resolve(&name),
            "update" => self.update(sender, name, &args[2], &args[3], round),
            "transfer" => self.transfer(sender, name, &args[2], round),
            "delete" => self.delete(sender, name),
            _ => Ok(vec![self.exists(&name)]),
        }
    }

    fn register(
        &mut self,
        sender: &str,
        name: String,
        cid: &[u8],
        price: &[u8],
        round: u64,
    ) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        if cid.is_empty() {
            return Err(NameRegistryError::EmptyCid);
        }
        let price = btoi(price).ok_or(NameRegistryError::BadPrice)?;
        if self.names.contains_key(&name) {
            return Err(NameRegistryError::Taken(name));
        }
        let line = log_line(LOG_PREFIX_REGISTERED, format!("{name}:{sender}").as_bytes());
        self.names.insert(
            name,
            NameRecord {
                owner: sender.to_string(),
                cid: String::from_utf8_lossy(cid).into_owned(),
                price,
                round,
            },
        );
        Ok(vec![line])
    }

    fn resolve(&self, name: &str) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        let record = self
            .names
            .get(name)
            .ok_or_else(|| NameRegistryError::UnknownName(name.to_string()))?;
        Ok(vec![
            log_line(LOG_PREFIX_OWNER, record.owner.as_bytes()),
            log_line(LOG_PREFIX_CID, record.cid.as_bytes()),
            log_line(LOG_PREFIX_PRICE, &itob(record.price)),
            log_line(LOG_PREFIX_ROUND, &itob(record.round)),
        ])
    }

    fn owned_mut(&mut self, sender: &str, name: &str) -> Result<&mut NameRecord, NameRegistryError> {
        let record = self
            .names
            .get_mut(name)
            .ok_or_else(|| NameRegistryError::UnknownName(name.to_string()))?;
        if record.owner != sender {
            return Err(NameRegistryError::NotOwner {
                name: name.to_string(),
                sender: sender.to_string(),
            });
        }
        Ok(record)
    }

    fn update(
        &mut self,
        sender: &str,
        name: String,
        cid: &[u8],
        price: &[u8],
        round: u64,
    ) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        let price = btoi(price).ok_or(NameRegistryError::BadPrice)?;
        let record = self.owned_mut(sender, &name)?;
        record.cid = String::from_utf8_lossy(cid).into_owned();
        record.price = price;
        record.round = round;
        Ok(vec![log_line(LOG_PREFIX_UPDATED, name.as_bytes())])
    }

    fn transfer(
        &mut self,
        sender: &str,
        name: String,
        new_owner: &[u8],
        round: u64,
    ) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        let new_owner = std::str::from_utf8(new_owner)
            .ok()
            .filter(|a| is_valid_address(a))
            .ok_or(NameRegistryError::BadOwner)?;
        let record = self.owned_mut(sender, &name)?;
        record.owner = new_owner.to_string();
        record.round = round;
        Ok(vec![log_line(
            LOG_PREFIX_TRANSFERRED,
            format!("{name}:{new_owner}").as_bytes(),
        )])
    }

    fn delete(&mut self, sender: &str, name: String) -> Result<Vec<Vec<u8>>, NameRegistryError> {
        self.owned_mut(sender, &name)?;
        self.names.remove(&name);
        Ok(vec![log_line(LOG_PREFIX_DELETED, name.as_bytes())])
    }

    fn exists(&self, name: &str) -> Vec<u8> {
        let flag = if self.names.contains_key(name) { "1" } else { "0" };
        log_line(LOG_PREFIX_EXISTS, format!("{name}:{flag}").as_bytes())
    }
}
