//! # Ownership Watermarks
//!
//! A watermark is a 64-character hex SHA-256 digest of
//! `"{owner}:{artifact length}:{salt}"`. Same inputs, same watermark. That
//! determinism is what makes verification possible without storing
//! anything: cut the candidate region out, regenerate from what's left,
//! compare.
//!
//! Two carriers are supported:
//!
//! - **Contiguous** ([`engine`]): the 64 ASCII bytes are spliced into the
//!   artifact at a start, end, middle or random offset. This is the form the
//!   envelope's watermark layer uses, because it is exactly invertible.
//! - **Steganographic** ([`stego`]): watermark bits are written into the
//!   least-significant bit of a random subset of 4-byte float samples. The
//!   artifact length doesn't change, weights barely move, and verification
//!   is statistical.
//!
//! ## Known approximation
//!
//! Contiguous [`verify`](engine::verify) only tries start, end, middle and
//! a handful of random offsets. A watermark embedded at a `Random` offset
//! that none of the tried offsets land on is reported as absent. Callers that
//! recorded the offset at embed time should use
//! [`verify_at`](engine::verify_at) instead, which is exact.

pub mod engine;
pub mod stego;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use engine::{
    embed, embed_multiple, generate, strip_at, verify, verify_at, verify_multiple, MultiEmbedded,
    WatermarkRecord,
};
pub use stego::{embed_steganographic, verify_steganographic, StegoEmbedded};

#[derive(Debug, Error, PartialEq)]
pub enum WatermarkError {
    #[error("carrier too small: need at least {needed} bytes, got {got}")]
    CarrierTooSmall { needed: usize, got: usize },

    #[error("invalid embedding strength {0}: must be in (0, 1]")]
    InvalidStrength(f64),

    #[error("watermark not present at offset {offset}")]
    NotPresent { offset: usize },
}

/// Where a contiguous watermark goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkPosition {
    #[default]
    Start,
    End,
    Middle,
    Random,
}

impl std::str::FromStr for WatermarkPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" | "beginning" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "middle" => Ok(Self::Middle),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown watermark position '{other}'")),
        }
    }
}

/// Output of a contiguous embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedded {
    pub data: Vec<u8>,
    pub watermark: String,
    pub position: WatermarkPosition,
    /// Byte offset the watermark was inserted at.
    pub offset: usize,
}

/// Result of any verification. `position`/`offset` are set only for a
/// structural contiguous match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub is_valid: bool,
    pub confidence: f64,
    pub position: Option<WatermarkPosition>,
    pub offset: Option<usize>,
}

impl Verification {
    pub(crate) fn absent() -> Self {
        Self {
            is_valid: false,
            confidence: 0.0,
            position: None,
            offset: None,
        }
    }

    pub(crate) fn scored(confidence: f64, threshold: f64) -> Self {
        Self {
            is_valid: confidence >= threshold,
            confidence,
            position: None,
            offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_parsing() {
        assert_eq!("start".parse::<WatermarkPosition>().unwrap(), WatermarkPosition::Start);
        assert_eq!("Beginning".parse::<WatermarkPosition>().unwrap(), WatermarkPosition::Start);
        assert_eq!("RANDOM".parse::<WatermarkPosition>().unwrap(), WatermarkPosition::Random);
        assert!("sideways".parse::<WatermarkPosition>().is_err());
        assert_eq!(WatermarkPosition::default(), WatermarkPosition::Start);
    }

    #[test]
    fn scored_threshold() {
        assert!(Verification::scored(0.8, 0.8).is_valid);
        assert!(!Verification::scored(0.79, 0.8).is_valid);
        assert!(!Verification::absent().is_valid);
    }
}
