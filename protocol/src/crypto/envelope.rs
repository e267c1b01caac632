//! # Envelope Codec
//!
//! The on-disk / on-wire form of an encrypted artifact:
//!
//! ```text
//! +----------------+------------------+----------------------+
//! | salt (32 B)    | auth tag (16 B)  | ciphertext (n B)     |
//! +----------------+------------------+----------------------+
//! ```
//!
//! Every call to [`EnvelopeCodec::encrypt`] draws a fresh salt from `OsRng`,
//! runs the passphrase through the configured KDF to get an AES-256 key and a
//! GCM nonce, and encrypts with the salt as associated data. The salt is
//! therefore authenticated twice over: it feeds the KDF and it's bound into
//! the tag. Flip any bit anywhere and decryption fails.
//!
//! There is no version byte and no length prefix. Salt and tag lengths are
//! compile-time constants shared by both sides; the KDF parameters travel
//! next to the envelope as [`SealedEnvelope::kdf`] (and, once persisted, in
//! the model's layer manifest).
//!
//! ## Failure model
//!
//! Decryption has exactly one failure: [`DecryptionError`]. Wrong
//! passphrase, truncated envelope, flipped tag bit, flipped ciphertext bit:
//! all the same error, no partial plaintext. An oracle that distinguishes
//! them is an oracle an attacker can use.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::encryption::{open_detached, seal_detached};
use super::kdf::{self, KdfError};
use crate::config::{
    KdfParams, ENVELOPE_HEADER_LENGTH, ENVELOPE_SALT_LENGTH, ENVELOPE_TAG_LENGTH,
};

/// The single, opaque decryption failure.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("decryption failed")]
pub struct DecryptionError;

/// Failures on the encrypt side. These are configuration problems, not
/// attacker-controlled inputs, so they're allowed to be specific.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("key derivation: {0}")]
    Kdf(#[from] KdfError),

    #[error("encryption failed")]
    Encrypt,
}

/// A parsed envelope. Immutable once produced.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub salt: [u8; ENVELOPE_SALT_LENGTH],
    pub auth_tag: [u8; ENVELOPE_TAG_LENGTH],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize to `salt || tag || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.auth_tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split raw bytes into header fields. Anything shorter than the fixed
    /// header is not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecryptionError> {
        if bytes.len() < ENVELOPE_HEADER_LENGTH {
            return Err(DecryptionError);
        }
        let mut salt = [0u8; ENVELOPE_SALT_LENGTH];
        let mut auth_tag = [0u8; ENVELOPE_TAG_LENGTH];
        salt.copy_from_slice(&bytes[..ENVELOPE_SALT_LENGTH]);
        auth_tag.copy_from_slice(&bytes[ENVELOPE_SALT_LENGTH..ENVELOPE_HEADER_LENGTH]);
        Ok(Self {
            salt,
            auth_tag,
            ciphertext: bytes[ENVELOPE_HEADER_LENGTH..].to_vec(),
        })
    }

    /// Total serialized length.
    pub fn len(&self) -> usize {
        ENVELOPE_HEADER_LENGTH + self.ciphertext.len()
    }

    /// An envelope is never empty (the header is always present), but
    /// clippy insists.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Envelope(salt={}.., ciphertext={} bytes)",
            hex::encode(&self.salt[..4]),
            self.ciphertext.len()
        )
    }
}

/// An envelope together with the KDF parameters needed to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub envelope: Envelope,
    pub kdf: KdfParams,
}

/// Passphrase-based AES-256-GCM envelope codec with a fixed KDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCodec {
    kdf: KdfParams,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
        }
    }
}

impl EnvelopeCodec {
    /// Build a codec, rejecting KDF parameters we won't run with.
    pub fn new(kdf: KdfParams) -> Result<Self, EnvelopeError> {
        kdf::validate(&kdf)?;
        Ok(Self { kdf })
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    /// Encrypt `plaintext` under `passphrase`. Never idempotent: two calls
    /// with identical inputs produce different salts and ciphertexts.
    pub fn encrypt(&self, plaintext: &[u8], passphrase: &[u8]) -> Result<SealedEnvelope, EnvelopeError> {
        let mut salt = [0u8; ENVELOPE_SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let derived = kdf::derive(passphrase, &salt, &self.kdf)?;
        let mut buffer = plaintext.to_vec();
        let auth_tag = seal_detached(&derived.key, &derived.nonce, &salt, &mut buffer)
            .map_err(|_| EnvelopeError::Encrypt)?;

        Ok(SealedEnvelope {
            envelope: Envelope {
                salt,
                auth_tag,
                ciphertext: buffer,
            },
            kdf: self.kdf,
        })
    }

    /// Decrypt an envelope. Fails closed with the one opaque error.
    pub fn decrypt(&self, envelope: &Envelope, passphrase: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        let derived = kdf::derive(passphrase, &envelope.salt, &self.kdf).map_err(|_| DecryptionError)?;
        let mut buffer = envelope.ciphertext.clone();
        open_detached(
            &derived.key,
            &derived.nonce,
            &envelope.salt,
            &envelope.auth_tag,
            &mut buffer,
        )
        .map_err(|_| DecryptionError)?;
        Ok(buffer)
    }

    /// Parse and decrypt raw envelope bytes.
    pub fn decrypt_bytes(&self, bytes: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        self.decrypt(&Envelope::from_bytes(bytes)?, passphrase)
    }
}

/// Encrypt with the default codec (PBKDF2-HMAC-SHA512, 100k iterations).
pub fn encrypt(plaintext: &[u8], passphrase: &[u8]) -> Result<SealedEnvelope, EnvelopeError> {
    EnvelopeCodec::default().encrypt(plaintext, passphrase)
}

/// Decrypt a sealed envelope using the KDF it was sealed with.
pub fn decrypt(sealed: &SealedEnvelope, passphrase: &[u8]) -> Result<Vec<u8>, DecryptionError> {
    let codec = EnvelopeCodec::new(sealed.kdf).map_err(|_| DecryptionError)?;
    codec.decrypt(&sealed.envelope, passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(KdfParams::Pbkdf2Sha512 { iterations: 1_000 }).unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = codec();
        let sealed = c.encrypt(b"model weights", b"passphrase").unwrap();
        assert_eq!(c.decrypt(&sealed.envelope, b"passphrase").unwrap(), b"model weights");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let c = codec();
        let sealed = c.encrypt(b"", b"pw").unwrap();
        assert_eq!(sealed.envelope.len(), ENVELOPE_HEADER_LENGTH);
        assert!(c.decrypt(&sealed.envelope, b"pw").unwrap().is_empty());
    }

    #[test]
    fn layout_is_salt_tag_ciphertext() {
        let c = codec();
        let sealed = c.encrypt(b"0123456789", b"pw").unwrap();
        let bytes = sealed.envelope.to_bytes();
        assert_eq!(bytes.len(), 48 + 10);
        assert_eq!(&bytes[..32], &sealed.envelope.salt);
        assert_eq!(&bytes[32..48], &sealed.envelope.auth_tag);
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), sealed.envelope);
        assert_eq!(c.decrypt_bytes(&bytes, b"pw").unwrap(), b"0123456789");
    }

    #[test]
    fn encryption_is_not_idempotent() {
        let c = codec();
        let a = c.encrypt(b"same", b"pw").unwrap();
        let b = c.encrypt(b"same", b"pw").unwrap();
        assert_ne!(a.envelope.salt, b.envelope.salt);
        assert_ne!(a.envelope.ciphertext, b.envelope.ciphertext);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let c = codec();
        let sealed = c.encrypt(b"secret", b"right").unwrap();
        assert_eq!(c.decrypt(&sealed.envelope, b"wrong"), Err(DecryptionError));
    }

    #[test]
    fn any_flipped_byte_fails_closed() {
        let c = codec();
        let bytes = c.encrypt(b"tamper me", b"pw").unwrap().envelope.to_bytes();
        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            assert_eq!(c.decrypt_bytes(&tampered, b"pw"), Err(DecryptionError), "byte {i}");
        }
    }

    #[test]
    fn short_input_fails_closed() {
        let c = codec();
        assert_eq!(c.decrypt_bytes(&[0u8; 47], b"pw"), Err(DecryptionError));
        assert_eq!(c.decrypt_bytes(&[], b"pw"), Err(DecryptionError));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let c = codec();
        let mut bytes = c.encrypt(b"some longer payload", b"pw").unwrap().envelope.to_bytes();
        bytes.pop();
        assert_eq!(c.decrypt_bytes(&bytes, b"pw"), Err(DecryptionError));
    }

    #[test]
    fn scrypt_codec_roundtrip() {
        let c = EnvelopeCodec::new(KdfParams::Scrypt { log_n: 4, r: 8, p: 1 }).unwrap();
        let sealed = c.encrypt(b"scrypt", b"pw").unwrap();
        assert_eq!(decrypt(&sealed, b"pw").unwrap(), b"scrypt");
    }

    #[test]
    fn codec_rejects_weak_kdf() {
        assert!(EnvelopeCodec::new(KdfParams::Pbkdf2Sha512 { iterations: 1 }).is_err());
    }
}
