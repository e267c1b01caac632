//! Contiguous watermark embedding and verification.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Embedded, Verification, WatermarkError, WatermarkPosition};
use crate::config::{
    DEFAULT_WATERMARK_SALT, WATERMARK_CONFIDENCE_THRESHOLD, WATERMARK_EXACT_CONFIDENCE,
    WATERMARK_LENGTH, WATERMARK_RANDOM_OFFSETS, WATERMARK_SUBSTRING_CONFIDENCE,
};
use crate::crypto::hash::sha256_hex;

/// Deterministic watermark for `(owner, length, salt)`.
pub fn generate(owner: &str, length: usize, custom_salt: Option<&str>) -> String {
    let salt = custom_salt.unwrap_or(DEFAULT_WATERMARK_SALT);
    sha256_hex(format!("{owner}:{length}:{salt}").as_bytes())
}

/// Splice `owner`'s watermark into `data` at `position`.
///
/// The watermark is generated from the *original* length, which is what
/// verification recovers after cutting the 64-byte region back out.
pub fn embed(data: &[u8], owner: &str, position: WatermarkPosition) -> Embedded {
    let offset = match position {
        WatermarkPosition::Start => 0,
        WatermarkPosition::End => data.len(),
        WatermarkPosition::Middle => data.len() / 2,
        WatermarkPosition::Random if data.is_empty() => 0,
        WatermarkPosition::Random => rand::thread_rng().gen_range(0..data.len()),
    };
    let watermark = generate(owner, data.len(), None);
    Embedded {
        data: splice(data, offset, watermark.as_bytes()),
        watermark,
        position,
        offset,
    }
}

/// Heuristic search for `owner`'s watermark.
///
/// Tries start, end, middle and [`WATERMARK_RANDOM_OFFSETS`] random
/// offsets. A structural match is confidence 1.0. Failing that, if
/// `expected` is supplied and occurs anywhere as a substring, confidence is
/// 0.8. Otherwise 0. Can miss a `Random` embed; see the module docs.
pub fn verify(data: &[u8], owner: &str, expected: Option<&str>) -> Verification {
    if data.len() >= WATERMARK_LENGTH {
        let span = data.len() - WATERMARK_LENGTH;
        let mut rng = rand::thread_rng();

        let mut candidates = vec![
            (0, WatermarkPosition::Start),
            (span, WatermarkPosition::End),
            (span / 2, WatermarkPosition::Middle),
        ];
        candidates.extend(
            (0..WATERMARK_RANDOM_OFFSETS).map(|_| (rng.gen_range(0..=span), WatermarkPosition::Random)),
        );

        for (offset, position) in candidates {
            if structural_match(data, owner, offset) {
                return Verification {
                    is_valid: true,
                    confidence: WATERMARK_EXACT_CONFIDENCE,
                    position: Some(position),
                    offset: Some(offset),
                };
            }
        }
    }

    match expected {
        Some(wm) if !wm.is_empty() && contains(data, wm.as_bytes()) => Verification::scored(
            WATERMARK_SUBSTRING_CONFIDENCE,
            WATERMARK_CONFIDENCE_THRESHOLD,
        ),
        _ => Verification::absent(),
    }
}

/// Exact check at a known offset.
pub fn verify_at(data: &[u8], owner: &str, offset: usize) -> Verification {
    if structural_match(data, owner, offset) {
        Verification {
            is_valid: true,
            confidence: WATERMARK_EXACT_CONFIDENCE,
            position: None,
            offset: Some(offset),
        }
    } else {
        Verification::absent()
    }
}

/// Remove the watermark at `offset`, returning the original bytes. Refuses
/// if the region there isn't `owner`'s watermark.
pub fn strip_at(data: &[u8], owner: &str, offset: usize) -> Result<Vec<u8>, WatermarkError> {
    if !structural_match(data, owner, offset) {
        return Err(WatermarkError::NotPresent { offset });
    }
    Ok(excise(data, offset))
}

// ---------------------------------------------------------------------------
// Multiple watermarks
// ---------------------------------------------------------------------------

/// One watermark inside a multi-embedded buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub index: usize,
    pub watermark: String,
    /// Offset in the *final* buffer.
    pub offset: usize,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiEmbedded {
    pub data: Vec<u8>,
    pub records: Vec<WatermarkRecord>,
}

fn index_salt(index: usize) -> String {
    format!("{DEFAULT_WATERMARK_SALT}-{index}")
}

/// Embed `count` independent watermarks at random offsets.
///
/// Watermark `i` is generated over the buffer length at the time it's
/// inserted, with a per-index salt. Recorded offsets always refer to the
/// final buffer: each insertion shifts the earlier records at or after it.
/// Insertions never land inside an earlier watermark.
pub fn embed_multiple(data: &[u8], owner: &str, count: usize) -> MultiEmbedded {
    let mut buf = data.to_vec();
    let mut records: Vec<WatermarkRecord> = Vec::with_capacity(count);
    let mut rng = rand::thread_rng();

    for index in 0..count {
        let mut offset = if buf.is_empty() { 0 } else { rng.gen_range(0..buf.len()) };
        if let Some(r) = records
            .iter()
            .find(|r| offset > r.offset && offset < r.offset + WATERMARK_LENGTH)
        {
            offset = r.offset;
        }

        let salt = index_salt(index);
        let watermark = generate(owner, buf.len(), Some(&salt));
        buf = splice(&buf, offset, watermark.as_bytes());

        for r in records.iter_mut().filter(|r| r.offset >= offset) {
            r.offset += WATERMARK_LENGTH;
        }
        records.push(WatermarkRecord {
            index,
            watermark,
            offset,
            salt,
        });
    }

    MultiEmbedded { data: buf, records }
}

/// Confidence = fraction of records independently confirmed at their
/// recorded offsets. Valid at >= 0.8.
pub fn verify_multiple(data: &[u8], owner: &str, records: &[WatermarkRecord]) -> Verification {
    if records.is_empty() {
        return Verification::absent();
    }
    let total = records.len();
    let confirmed = records
        .iter()
        .filter(|r| {
            // Buffer length at the moment record `index` was inserted.
            let inserted_after = total.saturating_sub(r.index);
            let Some(len_at_insert) = data.len().checked_sub(inserted_after * WATERMARK_LENGTH) else {
                return false;
            };
            region(data, r.offset).map_or(false, |found| {
                found == r.watermark.as_bytes()
                    && generate(owner, len_at_insert, Some(&r.salt)) == r.watermark
            })
        })
        .count();

    Verification::scored(confirmed as f64 / total as f64, WATERMARK_CONFIDENCE_THRESHOLD)
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

fn structural_match(data: &[u8], owner: &str, offset: usize) -> bool {
    let Some(found) = region(data, offset) else {
        return false;
    };
    let original_len = data.len() - WATERMARK_LENGTH;
    found == generate(owner, original_len, None).as_bytes()
}

fn region(data: &[u8], offset: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(WATERMARK_LENGTH)?)
}

fn splice(data: &[u8], offset: usize, insert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + insert.len());
    out.extend_from_slice(&data[..offset]);
    out.extend_from_slice(insert);
    out.extend_from_slice(&data[offset..]);
    out
}

fn excise(data: &[u8], offset: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() - WATERMARK_LENGTH);
    out.extend_from_slice(&data[..offset]);
    out.extend_from_slice(&data[offset + WATERMARK_LENGTH..]);
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
