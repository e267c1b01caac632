//! # Protocol Configuration & Constants
//!
//! Every magic number in the marketplace core lives here. If you're
//! hardcoding a constant somewhere else, move it here and save the next
//! person a grep.
//!
//! The envelope and watermark constants are wire-format constants: both the
//! sealing and the unsealing side must agree on them a priori, because the
//! envelope carries no length prefix. Changing them breaks every artifact
//! already sitting in the blob store.
//!
//! The second half of the file holds the typed configuration structs. Every
//! field has a documented default, and every struct is serde-friendly so the
//! node can load or print it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Envelope Wire Format
// ---------------------------------------------------------------------------

/// Length of the per-encryption random salt at the head of every envelope.
pub const ENVELOPE_SALT_LENGTH: usize = 32;

/// Length of the AES-GCM authentication tag that follows the salt.
pub const ENVELOPE_TAG_LENGTH: usize = 16;

/// Fixed header size: `salt || tag`. Anything shorter is not an envelope.
pub const ENVELOPE_HEADER_LENGTH: usize = ENVELOPE_SALT_LENGTH + ENVELOPE_TAG_LENGTH;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Not sixteen.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Bytes squeezed out of the KDF per envelope: key followed by nonce.
pub const KDF_OUTPUT_LENGTH: usize = AES_KEY_LENGTH + AES_NONCE_LENGTH;

/// Length of a marketplace symmetric key (the "passphrase" handed to buyers),
/// before hex encoding.
pub const ENCRYPTION_KEY_LENGTH: usize = 32;

/// The symmetric cipher. Fixed; this is not a pluggable-cipher library.
pub const SYMMETRIC_ALGORITHM: &str = "AES-256-GCM";

// ---------------------------------------------------------------------------
// Key Derivation
// ---------------------------------------------------------------------------

/// Default PBKDF2-HMAC-SHA512 iteration count.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// Lowest iteration count we accept. Tests run well above this; production
/// should never be anywhere near it.
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;

/// Default scrypt cost: N = 2^15.
pub const DEFAULT_SCRYPT_LOG_N: u8 = 15;

/// Default scrypt block size.
pub const DEFAULT_SCRYPT_R: u32 = 8;

/// Default scrypt parallelism.
pub const DEFAULT_SCRYPT_P: u32 = 1;

/// Largest scrypt `log_n` accepted. Manifests come from outside, and
/// memory use is `128 * r * 2^log_n` bytes.
pub const MAX_SCRYPT_LOG_N: u8 = 20;

/// Largest scrypt block size accepted.
pub const MAX_SCRYPT_R: u32 = 32;

/// Largest scrypt parallelism accepted.
pub const MAX_SCRYPT_P: u32 = 16;

/// Ceiling on scrypt memory, `128 * r * 2^log_n`: 256 MiB.
pub const MAX_SCRYPT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Largest PBKDF2 iteration count accepted.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

// ---------------------------------------------------------------------------
// Watermarking
// ---------------------------------------------------------------------------

/// Watermark length: a hex-encoded SHA-256 digest.
pub const WATERMARK_LENGTH: usize = 64;

/// Salt mixed into watermark generation when the caller supplies none.
pub const DEFAULT_WATERMARK_SALT: &str = "desci-watermark-v1";

/// Number of random offsets tried by contiguous verification, on top of the
/// start / end / middle candidates.
pub const WATERMARK_RANDOM_OFFSETS: usize = 8;

/// Confidence reported for an exact structural match.
pub const WATERMARK_EXACT_CONFIDENCE: f64 = 1.0;

/// Confidence reported when an explicitly supplied watermark is found as a
/// plain substring.
pub const WATERMARK_SUBSTRING_CONFIDENCE: f64 = 0.8;

/// Minimum confidence for multi-watermark and steganographic verification
/// to report `is_valid`.
pub const WATERMARK_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Default fraction of float samples perturbed by steganographic embedding.
pub const DEFAULT_STEGO_STRENGTH: f64 = 0.1;

// ---------------------------------------------------------------------------
// Ledger / Transaction Protocol
// ---------------------------------------------------------------------------

/// Interval between confirmation polls. One second, as the ledger's block
/// time is in that ballpark and faster polling only annoys the gateway.
pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default confirmation budget when the caller doesn't bring one.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of rounds an unsigned transaction stays valid after `first_valid`.
pub const TRANSACTION_VALIDITY_WINDOW: u64 = 1_000;

/// Flat fee assumed when the gateway reports a fee of zero.
pub const MIN_TRANSACTION_FEE: u64 = 1_000;

/// Default application id of the on-chain ModelRegistry program.
pub const DEFAULT_REGISTRY_APP_ID: u64 = 1_001;

/// Default application id of the on-chain Escrow program.
pub const DEFAULT_ESCROW_APP_ID: u64 = 1_002;

/// Default application id of the on-chain NameRegistry program.
pub const DEFAULT_NAME_REGISTRY_APP_ID: u64 = 1_003;

/// Suffix every registered name carries.
pub const NAME_SUFFIX: &str = ".desci";

/// Longest name, suffix included, the NameRegistry program stores.
pub const MAX_NAME_LENGTH: usize = 64;

/// Bech32 human-readable prefix for marketplace account addresses.
pub const ADDRESS_HRP: &str = "desci";

/// Log prefix emitted by the registry when a model id is assigned.
pub const LOG_PREFIX_MODEL_ID: &str = "ModelID:";

/// Log prefix emitted by the escrow program when an escrow id is assigned.
pub const LOG_PREFIX_ESCROW_ID: &str = "EscrowID:";

/// Log prefix carrying a content id.
pub const LOG_PREFIX_CID: &str = "CID:";

/// Log prefix carrying an escrow status code.
pub const LOG_PREFIX_STATUS: &str = "Status:";

/// NameRegistry: `REGISTERED:<name>:<owner>`.
pub const LOG_PREFIX_REGISTERED: &str = "REGISTERED:";

/// NameRegistry: owner address of a resolved name.
pub const LOG_PREFIX_OWNER: &str = "OWNER:";

/// NameRegistry: 8-byte big-endian price of a resolved name.
pub const LOG_PREFIX_PRICE: &str = "PRICE:";

/// NameRegistry: round in which a resolved name was last written.
pub const LOG_PREFIX_ROUND: &str = "ROUND:";

/// NameRegistry: `UPDATED:<name>`.
pub const LOG_PREFIX_UPDATED: &str = "UPDATED:";

/// NameRegistry: `TRANSFERRED:<name>:<new owner>`.
pub const LOG_PREFIX_TRANSFERRED: &str = "TRANSFERRED:";

/// NameRegistry: `DELETED:<name>`.
pub const LOG_PREFIX_DELETED: &str = "DELETED:";

/// NameRegistry: `EXISTS:<name>:1` or `EXISTS:<name>:0`.
pub const LOG_PREFIX_EXISTS: &str = "EXISTS:";

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

/// Pending escrows older than this are swept to `failed`.
pub const DEFAULT_ESCROW_MAX_AGE_HOURS: u64 = 24;

/// How often the node runs the sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Typed Configuration
// ---------------------------------------------------------------------------

/// Key-derivation function used by the envelope codec.
///
/// Algorithms are fixed; only cost parameters are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfParams {
    /// PBKDF2 with HMAC-SHA512.
    Pbkdf2Sha512 {
        /// Iteration count.
        iterations: u32,
    },
    /// scrypt with explicit cost parameters.
    Scrypt {
        /// log2 of the CPU/memory cost N.
        log_n: u8,
        /// Block size.
        r: u32,
        /// Parallelism.
        p: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Pbkdf2Sha512 {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl KdfParams {
    /// scrypt with the default cost parameters.
    pub fn scrypt_default() -> Self {
        KdfParams::Scrypt {
            log_n: DEFAULT_SCRYPT_LOG_N,
            r: DEFAULT_SCRYPT_R,
            p: DEFAULT_SCRYPT_P,
        }
    }
}

/// Configuration for the transaction confirmation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Application id of the ModelRegistry program.
    pub registry_app_id: u64,
    /// Application id of the Escrow program.
    pub escrow_app_id: u64,
    /// Application id of the NameRegistry program.
    pub name_registry_app_id: u64,
    /// Account that receives escrowed payments (the escrow app's address).
    pub escrow_address: String,
    /// Delay between confirmation polls.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Budget used by flows that don't pass an explicit timeout.
    #[serde(with = "duration_millis")]
    pub confirmation_timeout: Duration,
    /// Validity window, in rounds, stamped on every unsigned transaction.
    pub validity_window: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            registry_app_id: DEFAULT_REGISTRY_APP_ID,
            escrow_app_id: DEFAULT_ESCROW_APP_ID,
            name_registry_app_id: DEFAULT_NAME_REGISTRY_APP_ID,
            escrow_address: String::new(),
            poll_interval: CONFIRMATION_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            validity_window: TRANSACTION_VALIDITY_WINDOW,
        }
    }
}

/// Configuration for the escrow state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Pending escrows older than this many hours are swept to `failed`.
    pub max_age_hours: u64,
    /// Budget for `monitor_escrow` to see the purchase payment confirm.
    #[serde(with = "duration_millis")]
    pub monitor_timeout: Duration,
    /// Budget for release/refund settlement transactions.
    #[serde(with = "duration_millis")]
    pub settlement_timeout: Duration,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            max_age_hours: DEFAULT_ESCROW_MAX_AGE_HOURS,
            monitor_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            settlement_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

/// Top-level configuration for the marketplace flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MarketConfig {
    /// KDF used when sealing artifacts.
    pub kdf: KdfParams,
    /// Transaction protocol settings.
    pub protocol: ProtocolConfig,
    /// Escrow lifecycle settings.
    pub escrow: EscrowConfig,
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_header_is_salt_plus_tag() {
        assert_eq!(ENVELOPE_SALT_LENGTH, 32);
        assert_eq!(ENVELOPE_TAG_LENGTH, 16);
        assert_eq!(ENVELOPE_HEADER_LENGTH, 48);
        assert_eq!(ENVELOPE_TAG_LENGTH, AES_TAG_LENGTH);
    }

    #[test]
    fn kdf_output_covers_key_and_nonce() {
        assert_eq!(KDF_OUTPUT_LENGTH, 44);
    }

    #[test]
    fn default_kdf_is_pbkdf2() {
        assert_eq!(
            KdfParams::default(),
            KdfParams::Pbkdf2Sha512 {
                iterations: DEFAULT_PBKDF2_ITERATIONS
            }
        );
        assert!(DEFAULT_PBKDF2_ITERATIONS >= MIN_PBKDF2_ITERATIONS);
    }

    #[test]
    fn watermark_thresholds_are_ordered() {
        assert!(WATERMARK_SUBSTRING_CONFIDENCE < WATERMARK_EXACT_CONFIDENCE);
        assert!(WATERMARK_CONFIDENCE_THRESHOLD <= WATERMARK_SUBSTRING_CONFIDENCE);
    }

    #[test]
    fn poll_interval_is_one_second() {
        assert_eq!(CONFIRMATION_POLL_INTERVAL, Duration::from_secs(1));
        assert!(CONFIRMATION_POLL_INTERVAL < DEFAULT_CONFIRMATION_TIMEOUT);
    }

    #[test]
    fn market_config_json_roundtrip() {
        let cfg = MarketConfig {
            kdf: KdfParams::scrypt_default(),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MarketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
        assert!(json.contains("\"kdf\":{\"scrypt\":"));
    }
}
