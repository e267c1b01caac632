//! # Hybrid Public-Key Layer
//!
//! Wraps a 32-byte symmetric key for a recipient's X25519 public key, ECIES
//! style:
//!
//! 1. Generate an ephemeral X25519 keypair.
//! 2. Diffie-Hellman against the recipient's static public key.
//! 3. Feed `shared || ephemeral_pub || recipient_pub` through BLAKE3
//!    `derive_key` to get a wrapping key. Never use raw DH output as a key.
//! 4. AES-256-GCM the data key under the wrapping key, with the ephemeral
//!    public key as associated data.
//!
//! The result is a [`WrappedKey`]: ephemeral public key plus
//! `nonce || ciphertext || tag`. Only the holder of the recipient's static
//! secret can unwrap it.
//!
//! This takes the place of an RSA-OAEP key wrap: X25519 + BLAKE3 gives the
//! same "only the recipient unwraps" property with 32-byte public keys.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::encryption::{open, seal};
use crate::config::AES_KEY_LENGTH;

const WRAP_KDF_CONTEXT: &str = "desci-market 2026 hybrid key wrap v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HybridError {
    #[error("invalid recipient public key: expected 32 hex-encoded bytes")]
    InvalidPublicKey,

    #[error("invalid recipient secret key")]
    InvalidSecretKey,

    #[error("key wrap failed")]
    WrapFailed,

    #[error("key unwrap failed")]
    UnwrapFailed,
}

/// A data key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_public: [u8; 32],
    /// `nonce || ciphertext || tag`.
    pub sealed: Vec<u8>,
}

impl WrappedKey {
    /// Hex form used at the HTTP boundary: `eph_pub || sealed`.
    pub fn to_hex(&self) -> String {
        let mut buf = self.ephemeral_public.to_vec();
        buf.extend_from_slice(&self.sealed);
        hex::encode(buf)
    }

    pub fn from_hex(s: &str) -> Result<Self, HybridError> {
        let bytes = hex::decode(s).map_err(|_| HybridError::UnwrapFailed)?;
        if bytes.len() < 32 {
            return Err(HybridError::UnwrapFailed);
        }
        let mut ephemeral_public = [0u8; 32];
        ephemeral_public.copy_from_slice(&bytes[..32]);
        Ok(Self {
            ephemeral_public,
            sealed: bytes[32..].to_vec(),
        })
    }
}

/// A recipient's static X25519 keypair.
pub struct HybridKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl HybridKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_hex(s: &str) -> Result<Self, HybridError> {
        Ok(Self::from_secret_bytes(parse_32(s).ok_or(HybridError::InvalidSecretKey)?))
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Unwrap a key addressed to this keypair.
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<[u8; AES_KEY_LENGTH], HybridError> {
        let eph = PublicKey::from(wrapped.ephemeral_public);
        let shared = self.secret.diffie_hellman(&eph);
        let mut kek = derive_wrapping_key(shared.as_bytes(), &wrapped.ephemeral_public, &self.public_bytes());

        let opened = open(&kek, &wrapped.sealed, &wrapped.ephemeral_public);
        kek.zeroize();
        let mut plain = opened.map_err(|_| HybridError::UnwrapFailed)?;

        let result = <[u8; AES_KEY_LENGTH]>::try_from(plain.as_slice())
            .map_err(|_| HybridError::UnwrapFailed);
        plain.zeroize();
        result
    }
}

/// Parse a hex-encoded recipient public key.
pub fn parse_public_key(s: &str) -> Result<[u8; 32], HybridError> {
    parse_32(s).ok_or(HybridError::InvalidPublicKey)
}

/// Wrap `data_key` for `recipient_public`.
pub fn wrap_key(
    data_key: &[u8; AES_KEY_LENGTH],
    recipient_public: &[u8; 32],
) -> Result<WrappedKey, HybridError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_public));

    let mut kek = derive_wrapping_key(shared.as_bytes(), &ephemeral_public, recipient_public);
    let sealed = seal(&kek, data_key, &ephemeral_public);
    kek.zeroize();

    Ok(WrappedKey {
        ephemeral_public,
        sealed: sealed.map_err(|_| HybridError::WrapFailed)?,
    })
}

fn derive_wrapping_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(WRAP_KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(eph_pub);
    hasher.update(recipient_pub);
    *hasher.finalize().as_bytes()
}

fn parse_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.as_slice().try_into().ok()
}
