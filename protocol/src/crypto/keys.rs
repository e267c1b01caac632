//! # Key Material
//!
//! Two very different kinds of key live in the marketplace:
//!
//! - [`AccountKeypair`]: an Ed25519 ledger account. The core never holds a
//!   *user's* account key. The only keypairs that exist in-process are
//!   devnet/test accounts driving [`KeypairSigner`](crate::transaction::signing::KeypairSigner)
//!   and the simulated ledger. Accounts are addressed by a bech32 string
//!   (`desci1...`) over the raw 32-byte public key.
//! - [`EncryptionKey`]: the 32-byte symmetric secret a model is sealed
//!   under. Generated per publish, handed out hex-encoded, and only ever
//!   persisted as `hex(sha256(key))`.
//!
//! Neither type implements `Serialize`. Writing a secret to disk should be a
//! deliberate act, not a side effect of a derive.

use bech32::{Bech32, Hrp};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::hash::{ct_eq, sha256_hex};
use crate::config::{ADDRESS_HRP, ENCRYPTION_KEY_LENGTH};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid encryption key: expected {ENCRYPTION_KEY_LENGTH} hex-encoded bytes")]
    InvalidEncryptionKey,
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Encode a 32-byte Ed25519 public key as a bech32 account address.
pub fn address_from_public_key(public_key: &[u8; 32]) -> String {
    let hrp = Hrp::parse(ADDRESS_HRP).expect("static HRP is valid");
    bech32::encode::<Bech32>(hrp, public_key).expect("32-byte payload fits in bech32")
}

/// Decode an account address back into its public key bytes.
pub fn public_key_from_address(address: &str) -> Result<[u8; 32], KeyError> {
    let (hrp, data) =
        bech32::decode(address).map_err(|e| KeyError::InvalidAddress(e.to_string()))?;
    if hrp.as_str() != ADDRESS_HRP {
        return Err(KeyError::InvalidAddress(format!(
            "expected prefix '{ADDRESS_HRP}', got '{}'",
            hrp.as_str()
        )));
    }
    data.as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidAddress(format!("expected 32 bytes, got {}", data.len())))
}

/// True if `address` parses as a marketplace account address.
pub fn is_valid_address(address: &str) -> bool {
    public_key_from_address(address).is_ok()
}

// ---------------------------------------------------------------------------
// AccountKeypair
// ---------------------------------------------------------------------------

/// An Ed25519 ledger account. Devnet and tests only; production signing
/// happens in the user's wallet.
pub struct AccountKeypair {
    signing_key: SigningKey,
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSignature {
    bytes: Vec<u8>,
}

impl AccountKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Handy for fixtures.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load from a hex-encoded 32-byte secret. Devnet convenience.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The bech32 account address.
    pub fn address(&self) -> String {
        address_from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> AccountSignature {
        AccountSignature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }
}

impl Clone for AccountKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for AccountKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountKeypair({})", self.address())
    }
}

impl AccountSignature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for AccountSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.to_hex();
        write!(f, "AccountSignature({}..)", &h[..h.len().min(8)])
    }
}

/// Verify `signature` over `message` for the account at `address`.
///
/// Malformed addresses and signatures verify as `false`; callers only ever
/// want a yes/no.
pub fn verify_signature(address: &str, message: &[u8], signature: &AccountSignature) -> bool {
    let Ok(pk) = public_key_from_address(address) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.bytes.as_slice()) else {
        return false;
    };
    vk.verify(message, &DalekSignature::from_bytes(&sig_bytes))
        .is_ok()
}

// ---------------------------------------------------------------------------
// EncryptionKey
// ---------------------------------------------------------------------------

/// The symmetric secret a model artifact is sealed under.
///
/// Hex-encoded at every boundary (HTTP, CLI, escrow record). The bytes are
/// wiped when the value drops.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; ENCRYPTION_KEY_LENGTH],
}

impl EncryptionKey {
    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ENCRYPTION_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; ENCRYPTION_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let mut decoded = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidEncryptionKey)?;
        let result = <[u8; ENCRYPTION_KEY_LENGTH]>::try_from(decoded.as_slice())
            .map(Self::from_bytes)
            .map_err(|_| KeyError::InvalidEncryptionKey);
        decoded.zeroize();
        result
    }

    pub fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_LENGTH] {
        &self.bytes
    }

    /// The passphrase form handed to the envelope codec and to buyers.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// `hex(sha256(key bytes))`, the only form that is ever persisted.
    pub fn hash(&self) -> String {
        sha256_hex(&self.bytes)
    }

    /// Constant-time check against a stored key hash.
    pub fn matches_hash(&self, key_hash: &str) -> bool {
        ct_eq(self.hash().as_bytes(), key_hash.to_ascii_lowercase().as_bytes())
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        ct_eq(&self.bytes, &other.bytes)
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}
