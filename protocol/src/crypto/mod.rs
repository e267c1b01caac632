//! # Cryptographic Primitives
//!
//! Everything that turns a model artifact into something safe to hand to a
//! public blob store, and back:
//!
//! - **AES-256-GCM** for the envelope and for key wrapping.
//! - **PBKDF2-HMAC-SHA512** (default) or **scrypt** to turn a passphrase
//!   into a key and nonce.
//! - **X25519 + BLAKE3** for the optional hybrid layer that addresses a
//!   sealed artifact to one buyer.
//! - **Ed25519** for devnet accounts; **SHA-256** for anything persisted.
//!
//! All thin wrappers around audited RustCrypto / dalek implementations. The
//! algorithms are fixed. This is not a pluggable cipher-suite library and
//! never will be.

pub mod encryption;
pub mod envelope;
pub mod hash;
pub mod hybrid;
pub mod kdf;
pub mod keys;
pub mod layers;

pub use envelope::{decrypt, encrypt, DecryptionError, Envelope, EnvelopeCodec, SealedEnvelope};
pub use hash::{sha256, sha256_hex};
pub use hybrid::{HybridKeypair, WrappedKey};
pub use keys::{AccountKeypair, EncryptionKey};
pub use layers::{unseal, EncryptionPlan, LayerRecord, LayeredEnvelope, UnsealKeys};
