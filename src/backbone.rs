//! Opaque backbone-encoder interface and the token batches it consumes.
//!
//! The transformer itself is an external collaborator. This crate only
//! needs its final hidden-state sequence, its hidden size, and the ability
//! to persist and deep-copy it; everything else stays behind the trait.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::{EncoderError, EncoderResult};

/// Conventional name of the token-id tensor in a [`TokenBatch`].
pub const INPUT_IDS: &str = "input_ids";

/// Conventional name of the attention-mask tensor in a [`TokenBatch`].
pub const ATTENTION_MASK: &str = "attention_mask";

/// One side's tokenized inputs: a mapping of named tensors produced by an
/// external tokenizer/collator (`input_ids`, `attention_mask`, ...).
///
/// The batch is opaque to this crate except for the attention mask, which
/// sentence pooling needs.
#[derive(Debug, Clone, Default)]
pub struct TokenBatch {
    tensors: HashMap<String, Tensor>,
}

impl TokenBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch from the two conventional tensors.
    pub fn from_ids(input_ids: Tensor, attention_mask: Tensor) -> Self {
        let mut batch = Self::new();
        batch.insert(INPUT_IDS, input_ids);
        batch.insert(ATTENTION_MASK, attention_mask);
        batch
    }

    /// Insert or replace a named tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Look up a named tensor.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// The attention mask, required for sentence pooling.
    pub fn attention_mask(&self) -> EncoderResult<&Tensor> {
        self.tensors
            .get(ATTENTION_MASK)
            .ok_or_else(|| EncoderError::MissingTensor {
                name: ATTENTION_MASK.to_string(),
            })
    }

    /// Iterate over the named tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Tensor)> for TokenBatch {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// A pretrained text encoder, treated as an opaque service.
///
/// Implementations wrap whatever architecture produces per-token hidden
/// states; the bi-encoder only consumes the final hidden-state sequence.
pub trait TextBackbone: Send + Sync {
    /// Run the encoder over a token batch, returning the final
    /// hidden-state sequence `[batch, seq_len, hidden]`.
    fn forward(&self, batch: &TokenBatch) -> EncoderResult<Tensor>;

    /// Width of the hidden-state vectors this encoder produces.
    fn hidden_size(&self) -> usize;

    /// Device the encoder's parameters live on.
    fn device(&self) -> &Device;

    /// Persist the encoder's weights into `dir`.
    fn save_pretrained(&self, dir: &Path) -> EncoderResult<()>;

    /// Produce an independent parameter copy (not a shared-storage clone).
    /// Used when an untied pair is built from a single pretrained
    /// identifier.
    fn duplicate(&self) -> EncoderResult<Self>
    where
        Self: Sized;
}

/// Factory for [`TextBackbone`] instances, resolving pretrained
/// identifiers or local weight directories.
pub trait BackboneLoader {
    /// The backbone type this loader constructs.
    type Backbone: TextBackbone;

    /// Load a backbone from a pretrained-model identifier or a local
    /// directory containing saved weights.
    fn from_pretrained(&self, name_or_path: &str) -> EncoderResult<Self::Backbone>;
}
