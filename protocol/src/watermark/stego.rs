//! Steganographic watermarks in float LSBs.
//!
//! The carrier is read as little-endian `f32` samples (trailing bytes that
//! don't fill a sample are left alone). Each sample is selected with
//! probability `strength`; selected samples get their least-significant
//! mantissa bit overwritten by the next bit of the watermark string, cycling
//! through its 512 bits.
//!
//! Selection is driven by a seeded `StdRng`. [`embed_steganographic`]
//! returns the seed, and [`verify_steganographic`] replays it to read
//! exactly the samples that were written. Without a seed, verification falls
//! back to drawing its own independent selection, which is how the scheme
//! historically worked. That path almost never reaches the threshold on a
//! genuine carrier, since most of the samples it reads were never written.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use super::{engine::generate, Verification, WatermarkError};
use crate::config::WATERMARK_CONFIDENCE_THRESHOLD;

const SAMPLE_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StegoEmbedded {
    pub data: Vec<u8>,
    pub watermark: String,
    /// Replays the sample selection at verify time.
    pub seed: u64,
    /// Number of samples written.
    pub modified: usize,
}

fn check(data: &[u8], strength: f64) -> Result<(), WatermarkError> {
    if !(strength > 0.0 && strength <= 1.0) {
        return Err(WatermarkError::InvalidStrength(strength));
    }
    if data.len() < SAMPLE_SIZE {
        return Err(WatermarkError::CarrierTooSmall {
            needed: SAMPLE_SIZE,
            got: data.len(),
        });
    }
    Ok(())
}

fn watermark_bit(watermark: &[u8], k: usize) -> u32 {
    let byte = watermark[(k / 8) % watermark.len()];
    u32::from((byte >> (7 - (k % 8))) & 1)
}

/// Write `owner`'s watermark into the float LSBs of `data`.
pub fn embed_steganographic(
    data: &[u8],
    owner: &str,
    strength: f64,
) -> Result<StegoEmbedded, WatermarkError> {
    check(data, strength)?;

    let watermark = generate(owner, data.len(), None);
    let bits = watermark.as_bytes();
    let seed = rand::rngs::OsRng.next_u64();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut out = data.to_vec();
    let mut k = 0usize;
    for chunk in out.chunks_exact_mut(SAMPLE_SIZE) {
        if rng.gen::<f64>() >= strength {
            continue;
        }
        let mut raw = [0u8; SAMPLE_SIZE];
        raw.copy_from_slice(chunk);
        let sample = f32::from_le_bytes(raw);
        let marked = f32::from_bits((sample.to_bits() & !1) | watermark_bit(bits, k));
        chunk.copy_from_slice(&marked.to_le_bytes());
        k += 1;
    }

    Ok(StegoEmbedded {
        data: out,
        watermark,
        seed,
        modified: k,
    })
}

/// Score positional bit agreement between the carrier and `owner`'s
/// watermark. Valid at >= 0.8.
///
/// Pass the embed seed to read the written samples. With `None` the
/// selection is drawn independently of the embed (see the module docs).
pub fn verify_steganographic(
    data: &[u8],
    owner: &str,
    strength: f64,
    seed: Option<u64>,
) -> Result<Verification, WatermarkError> {
    check(data, strength)?;

    let watermark = generate(owner, data.len(), None);
    let bits = watermark.as_bytes();
    let mut rng: Box<dyn RngCore> = match seed {
        Some(s) => Box::new(StdRng::seed_from_u64(s)),
        None => Box::new(rand::thread_rng()),
    };

    let (mut sampled, mut agreed) = (0usize, 0usize);
    for chunk in data.chunks_exact(SAMPLE_SIZE) {
        if rng.gen::<f64>() >= strength {
            continue;
        }
        let mut raw = [0u8; SAMPLE_SIZE];
        raw.copy_from_slice(chunk);
        if f32::from_le_bytes(raw).to_bits() & 1 == watermark_bit(bits, sampled) {
            agreed += 1;
        }
        sampled += 1;
    }

    if sampled == 0 {
        return Ok(Verification::absent());
    }
    Ok(Verification::scored(
        agreed as f64 / sampled as f64,
        WATERMARK_CONFIDENCE_THRESHOLD,
    ))
}
