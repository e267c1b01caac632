//! # Layered Sealing
//!
//! An artifact goes through up to three layers on its way to the blob store:
//!
//! ```text
//! plaintext ─▶ [watermark] ─▶ [symmetric envelope] ─▶ [hybrid wrap] ─▶ payload
//! ```
//!
//! The order is fixed by [`EncryptionPlan`]; callers choose which layers are
//! present, not where they go. Each applied layer leaves a [`LayerRecord`]
//! holding exactly what its inverse needs (watermark offset, KDF parameters,
//! wrapped data key). [`unseal`] walks the records backwards.
//!
//! Everything happens in memory. Nothing is persisted until the whole plan
//! has succeeded, so a hybrid failure after the symmetric step leaves no
//! half-sealed artifact anywhere.
//!
//! Records contain no secrets. They are stored alongside the model as its
//! layer manifest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::encryption::{open, seal};
use super::envelope::{DecryptionError, EnvelopeCodec, EnvelopeError};
use super::hybrid::{wrap_key, HybridError, HybridKeypair, WrappedKey};
use super::keys::EncryptionKey;
use crate::config::KdfParams;
use crate::watermark::{self, WatermarkError, WatermarkPosition};

const HYBRID_LAYER_AAD: &[u8] = b"desci hybrid layer v1";

#[derive(Debug, Error, PartialEq)]
pub enum LayerError {
    #[error("plan has no encrypting layer")]
    NoEncryption,

    #[error("symmetric layer requires a passphrase")]
    MissingPassphrase,

    #[error("hybrid layer requires the recipient's secret key")]
    MissingRecipientKey,

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("hybrid: {0}")]
    Hybrid(#[from] HybridError),

    #[error("watermark: {0}")]
    Watermark(#[from] WatermarkError),
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Watermark { owner: String, position: WatermarkPosition },
    Symmetric { kdf: KdfParams },
    Hybrid { recipient_public: [u8; 32] },
}

/// What was applied, and how to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRecord {
    Watermark {
        owner: String,
        watermark: String,
        position: WatermarkPosition,
        offset: usize,
    },
    Symmetric {
        kdf: KdfParams,
    },
    Hybrid {
        wrapped: WrappedKey,
    },
}

/// The sealed artifact plus its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredEnvelope {
    pub payload: Vec<u8>,
    pub layers: Vec<LayerRecord>,
}

impl LayeredEnvelope {
    /// The watermark layer's record, if one was applied.
    pub fn watermark(&self) -> Option<&LayerRecord> {
        self.layers
            .iter()
            .find(|l| matches!(l, LayerRecord::Watermark { .. }))
    }
}

/// Secrets needed to unseal. Only the ones matching applied layers are
/// required.
#[derive(Default)]
pub struct UnsealKeys<'a> {
    pub passphrase: Option<&'a [u8]>,
    pub recipient: Option<&'a HybridKeypair>,
}

/// Which layers to apply. The order is not configurable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptionPlan {
    watermark: Option<(String, WatermarkPosition)>,
    symmetric: Option<KdfParams>,
    hybrid: Option<[u8; 32]>,
}

impl EncryptionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(mut self, owner: impl Into<String>, position: WatermarkPosition) -> Self {
        self.watermark = Some((owner.into(), position));
        self
    }

    pub fn with_symmetric(mut self, kdf: KdfParams) -> Self {
        self.symmetric = Some(kdf);
        self
    }

    pub fn with_hybrid(mut self, recipient_public: [u8; 32]) -> Self {
        self.hybrid = Some(recipient_public);
        self
    }

    /// Layers in application order.
    pub fn layers(&self) -> Vec<Layer> {
        let mut out = Vec::with_capacity(3);
        if let Some((owner, position)) = &self.watermark {
            out.push(Layer::Watermark {
                owner: owner.clone(),
                position: *position,
            });
        }
        if let Some(kdf) = self.symmetric {
            out.push(Layer::Symmetric { kdf });
        }
        if let Some(recipient_public) = self.hybrid {
            out.push(Layer::Hybrid { recipient_public });
        }
        out
    }

    /// Apply every layer in order. `passphrase` is required iff the plan
    /// has a symmetric layer.
    pub fn seal(&self, data: &[u8], passphrase: Option<&[u8]>) -> Result<LayeredEnvelope, LayerError> {
        if self.symmetric.is_none() && self.hybrid.is_none() {
            return Err(LayerError::NoEncryption);
        }

        let mut payload = data.to_vec();
        let mut records = Vec::new();
        for layer in self.layers() {
            let (next, record) = layer.apply(&payload, passphrase)?;
            payload = next;
            records.push(record);
        }
        Ok(LayeredEnvelope {
            payload,
            layers: records,
        })
    }
}

impl Layer {
    fn apply(&self, input: &[u8], passphrase: Option<&[u8]>) -> Result<(Vec<u8>, LayerRecord), LayerError> {
        match self {
            Layer::Watermark { owner, position } => {
                let embedded = watermark::embed(input, owner, *position);
                Ok((
                    embedded.data,
                    LayerRecord::Watermark {
                        owner: owner.clone(),
                        watermark: embedded.watermark,
                        position: *position,
                        offset: embedded.offset,
                    },
                ))
            }
            Layer::Symmetric { kdf } => {
                let passphrase = passphrase.ok_or(LayerError::MissingPassphrase)?;
                let sealed = EnvelopeCodec::new(*kdf)?.encrypt(input, passphrase)?;
                Ok((sealed.envelope.to_bytes(), LayerRecord::Symmetric { kdf: *kdf }))
            }
            Layer::Hybrid { recipient_public } => {
                let data_key = EncryptionKey::generate();
                let wrapped = wrap_key(data_key.as_bytes(), recipient_public)?;
                let sealed = seal(data_key.as_bytes(), input, HYBRID_LAYER_AAD)
                    .map_err(|_| HybridError::WrapFailed)?;
                Ok((sealed, LayerRecord::Hybrid { wrapped }))
            }
        }
    }
}

impl LayerRecord {
    /// Exact inverse of the layer that produced this record.
    pub fn invert(&self, input: &[u8], keys: &UnsealKeys<'_>) -> Result<Vec<u8>, LayerError> {
        match self {
            LayerRecord::Watermark { owner, offset, .. } => {
                Ok(watermark::strip_at(input, owner, *offset)?)
            }
            LayerRecord::Symmetric { kdf } => {
                let passphrase = keys.passphrase.ok_or(LayerError::MissingPassphrase)?;
                let codec = EnvelopeCodec::new(*kdf).map_err(|_| DecryptionError)?;
                Ok(codec.decrypt_bytes(input, passphrase)?)
            }
            LayerRecord::Hybrid { wrapped } => {
                let recipient = keys.recipient.ok_or(LayerError::MissingRecipientKey)?;
                let data_key = EncryptionKey::from_bytes(recipient.unwrap_key(wrapped)?);
                open(data_key.as_bytes(), input, HYBRID_LAYER_AAD).map_err(|_| LayerError::Decryption(DecryptionError))
            }
        }
    }
}

/// Undo every layer, last applied first.
pub fn unseal(envelope: &LayeredEnvelope, keys: &UnsealKeys<'_>) -> Result<Vec<u8>, LayerError> {
    unseal_through(envelope, envelope.layers.len(), keys)
}

/// Undo only the outermost `count` layers. `unseal_through(env, 1, ..)` on
/// a watermark+symmetric envelope yields the watermarked bytes.
pub fn unseal_through(
    envelope: &LayeredEnvelope,
    count: usize,
    keys: &UnsealKeys<'_>,
) -> Result<Vec<u8>, LayerError> {
    let mut data = envelope.payload.clone();
    for record in envelope.layers.iter().rev().take(count) {
        data = record.invert(&data, keys)?;
    }
    Ok(data)
}
