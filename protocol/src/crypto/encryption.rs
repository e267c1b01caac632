//! # AES-256-GCM Primitives
//!
//! The raw AEAD building blocks. Two shapes live here:
//!
//! - [`seal`] / [`open`]: random nonce, output `nonce || ciphertext || tag`.
//!   Used for key wrapping in the hybrid layer, where the key is fresh per
//!   message and carrying the nonce inline is the simplest thing that works.
//! - [`seal_detached`] / [`open_detached`]: caller-supplied nonce, tag kept
//!   separate, in-place. Used by the envelope codec, whose nonce comes out of
//!   the KDF and whose tag sits in a fixed header slot.
//!
//! Errors are deliberately vague. "Wrong key" and "tampered ciphertext" look
//! identical from the outside, and that's the point.

use aes_gcm::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors from the AEAD primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Encrypt with a random nonce. Returns `nonce || ciphertext || tag`.
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]. The AAD must match byte for byte.
pub fn open(key: &[u8; AES_KEY_LENGTH], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if data.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }
    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}

/// Encrypt `buffer` in place with an explicit nonce; returns the detached tag.
///
/// The nonce MUST be unique per key. The envelope codec guarantees this by
/// deriving both from a fresh salt on every call.
pub fn seal_detached(
    key: &[u8; AES_KEY_LENGTH],
    nonce: &[u8; AES_NONCE_LENGTH],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; AES_TAG_LENGTH], EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, buffer)
        .map_err(|_| EncryptionError::EncryptFailed)?;
    let mut out = [0u8; AES_TAG_LENGTH];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buffer` in place against a detached tag.
///
/// On failure the buffer is zeroized before returning, so a caller that
/// ignores the error still can't read half-decrypted bytes.
pub fn open_detached(
    key: &[u8; AES_KEY_LENGTH],
    nonce: &[u8; AES_NONCE_LENGTH],
    aad: &[u8],
    tag: &[u8; AES_TAG_LENGTH],
    buffer: &mut [u8],
) -> Result<(), EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    let result = cipher.decrypt_in_place_detached(
        Nonce::from_slice(nonce),
        aad,
        buffer,
        Tag::from_slice(tag),
    );
    if result.is_err() {
        buffer.zeroize();
        return Err(EncryptionError::DecryptFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"wrapped data key", b"ctx").unwrap();
        assert_eq!(sealed.len(), AES_NONCE_LENGTH + 16 + AES_TAG_LENGTH);
        assert_eq!(open(&key, &sealed, b"ctx").unwrap(), b"wrapped data key");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = test_key();
        let sealed = seal(&key, b"secret", b"right").unwrap();
        assert_eq!(
            open(&key, &sealed, b"wrong"),
            Err(EncryptionError::DecryptFailed)
        );
    }

    #[test]
    fn short_input_rejected() {
        assert_eq!(
            open(&test_key(), &[0u8; 20], b""),
            Err(EncryptionError::CiphertextTooShort)
        );
    }

    #[test]
    fn detached_roundtrip() {
        let key = test_key();
        let nonce = [7u8; AES_NONCE_LENGTH];
        let mut buf = b"in place".to_vec();
        let tag = seal_detached(&key, &nonce, b"salt", &mut buf).unwrap();
        assert_ne!(buf, b"in place");
        open_detached(&key, &nonce, b"salt", &tag, &mut buf).unwrap();
        assert_eq!(buf, b"in place");
    }

    #[test]
    fn detached_failure_zeroizes_buffer() {
        let key = test_key();
        let nonce = [7u8; AES_NONCE_LENGTH];
        let mut buf = b"do not leak me".to_vec();
        let mut tag = seal_detached(&key, &nonce, b"", &mut buf).unwrap();
        tag[0] ^= 1;
        assert!(open_detached(&key, &nonce, b"", &tag, &mut buf).is_err());
        assert!(buf.iter().all(|b| *b == 0));
    }
}
