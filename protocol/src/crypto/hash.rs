//! # Hashing Utilities
//!
//! Two hash functions, two jobs:
//!
//! - **SHA-256** is what the outside world sees. Key hashes, watermark
//!   values and content ids are SHA-256 because they cross a boundary: a
//!   record store, an artifact, an IPFS-style content id.
//! - **BLAKE3** is for identifiers we mint ourselves (escrow ids, group
//!   ids), always through `derive_key` domain separation so an escrow id can
//!   never be confused with a group id computed over the same bytes.
//!
//! Comparisons of secret-derived digests go through [`ct_eq`]. A `==` on a
//! key hash leaks how many leading bytes matched; `subtle` doesn't.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of `data` as a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `data`. The format used for key hashes and
/// watermark values.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Compute a domain-separated BLAKE3 hash.
///
/// Uses BLAKE3's `derive_key` mode, which mixes the context into the IV.
/// Contexts are hardcoded, globally unique strings.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Domain-separated hash over several parts, each length-prefixed so that
/// `("ab", "c")` and `("a", "bc")` hash differently.
pub fn domain_separated_hash_parts(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time byte comparison. Length mismatch returns `false` (the
/// length itself is not secret).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
