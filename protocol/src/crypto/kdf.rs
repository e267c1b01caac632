//! Passphrase key derivation for the envelope codec.
//!
//! One call produces 44 bytes: a 32-byte AES-256 key followed by the 12-byte
//! GCM nonce. The salt is fresh per envelope, so the nonce never repeats
//! under a given key.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{
    KdfParams, AES_KEY_LENGTH, AES_NONCE_LENGTH, KDF_OUTPUT_LENGTH, MAX_PBKDF2_ITERATIONS,
    MAX_SCRYPT_LOG_N, MAX_SCRYPT_MEMORY_BYTES, MAX_SCRYPT_P, MAX_SCRYPT_R, MIN_PBKDF2_ITERATIONS,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    #[error("pbkdf2 iteration count {0} below minimum {MIN_PBKDF2_ITERATIONS}")]
    TooFewIterations(u32),

    #[error("pbkdf2 iteration count {0} above maximum {MAX_PBKDF2_ITERATIONS}")]
    TooManyIterations(u32),

    #[error("invalid scrypt parameters (log_n={log_n}, r={r}, p={p})")]
    InvalidScryptParams { log_n: u8, r: u32, p: u32 },

    #[error("scrypt parameters too expensive (log_n={log_n}, r={r}, p={p})")]
    ScryptTooExpensive { log_n: u8, r: u32, p: u32 },

    #[error("key derivation failed")]
    DerivationFailed,
}

/// Key and nonce derived from a passphrase. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    pub key: [u8; AES_KEY_LENGTH],
    pub nonce: [u8; AES_NONCE_LENGTH],
}

/// Reject parameters we refuse to run with, before doing any work.
/// Costs are bounded on both sides; manifests come from untrusted uploads.
pub fn validate(params: &KdfParams) -> Result<(), KdfError> {
    match *params {
        KdfParams::Pbkdf2Sha512 { iterations } if iterations < MIN_PBKDF2_ITERATIONS => {
            Err(KdfError::TooFewIterations(iterations))
        }
        KdfParams::Pbkdf2Sha512 { iterations } if iterations > MAX_PBKDF2_ITERATIONS => {
            Err(KdfError::TooManyIterations(iterations))
        }
        KdfParams::Pbkdf2Sha512 { .. } => Ok(()),
        KdfParams::Scrypt { log_n, r, p } => {
            if log_n > MAX_SCRYPT_LOG_N
                || r > MAX_SCRYPT_R
                || p > MAX_SCRYPT_P
                || scrypt_memory(log_n, r) > MAX_SCRYPT_MEMORY_BYTES
            {
                return Err(KdfError::ScryptTooExpensive { log_n, r, p });
            }
            scrypt::Params::new(log_n, r, p, KDF_OUTPUT_LENGTH)
                .map(|_| ())
                .map_err(|_| KdfError::InvalidScryptParams { log_n, r, p })
        }
    }
}

/// Bytes of working memory scrypt needs: `128 * r * 2^log_n`.
fn scrypt_memory(log_n: u8, r: u32) -> u64 {
    1u64.checked_shl(u32::from(log_n))
        .and_then(|n| n.checked_mul(128 * u64::from(r)))
        .unwrap_or(u64::MAX)
}

/// Derive key and nonce from `passphrase` and `salt`.
pub fn derive(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedKey, KdfError> {
    validate(params)?;

    let mut okm = [0u8; KDF_OUTPUT_LENGTH];
    match *params {
        KdfParams::Pbkdf2Sha512 { iterations } => {
            pbkdf2_hmac::<Sha512>(passphrase, salt, iterations, &mut okm);
        }
        KdfParams::Scrypt { log_n, r, p } => {
            let sp = scrypt::Params::new(log_n, r, p, KDF_OUTPUT_LENGTH)
                .map_err(|_| KdfError::InvalidScryptParams { log_n, r, p })?;
            if scrypt::scrypt(passphrase, salt, &sp, &mut okm).is_err() {
                okm.zeroize();
                return Err(KdfError::DerivationFailed);
            }
        }
    }

    let mut derived = DerivedKey {
        key: [0u8; AES_KEY_LENGTH],
        nonce: [0u8; AES_NONCE_LENGTH],
    };
    derived.key.copy_from_slice(&okm[..AES_KEY_LENGTH]);
    derived.nonce.copy_from_slice(&okm[AES_KEY_LENGTH..]);
    okm.zeroize();
    Ok(derived)
}
