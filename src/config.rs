//! Configuration for the bi-encoder model and its projection head.
//!
//! All knobs are explicit, enumerated structs. Unknown pooling or loss
//! names fail at parse time; a non-positive temperature fails validation
//! before any weights are loaded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EncoderError, EncoderResult};

/// Strategy for reducing a token-level hidden-state sequence to one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolingMethod {
    /// Masked average over all real (non-padded) token positions.
    Mean,
    /// First sequence position only.
    Cls,
}

impl FromStr for PoolingMethod {
    type Err = EncoderError;

    fn from_str(s: &str) -> EncoderResult<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "cls" => Ok(Self::Cls),
            other => Err(EncoderError::ConfigError {
                message: format!("unknown pooling method '{}', expected 'mean' or 'cls'", other),
            }),
        }
    }
}

impl fmt::Display for PoolingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Cls => write!(f, "cls"),
        }
    }
}

/// Training-loss policy applied to the similarity/target pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossType {
    /// Cross-entropy against a single in-batch positive per query.
    Softmax,
    /// Per-row cross-entropy against a multi-label float target, averaged
    /// over rows with nonzero loss.
    MultiSoftmax,
    /// Negative log of the softmax mass placed on positive candidates,
    /// restricted to rows that have at least one positive.
    PositiveMass,
    /// Hinge loss with margin 0.5 over the binarized, flattened target.
    Hinge,
}

impl FromStr for LossType {
    type Err = EncoderError;

    fn from_str(s: &str) -> EncoderResult<Self> {
        match s {
            "softmax" => Ok(Self::Softmax),
            "multi-softmax" => Ok(Self::MultiSoftmax),
            "positive-mass" => Ok(Self::PositiveMass),
            "hinge" => Ok(Self::Hinge),
            other => Err(EncoderError::ConfigError {
                message: format!(
                    "unknown loss type '{}', expected one of 'softmax', 'multi-softmax', 'positive-mass', 'hinge'",
                    other
                ),
            }),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Softmax => write!(f, "softmax"),
            Self::MultiSoftmax => write!(f, "multi-softmax"),
            Self::PositiveMass => write!(f, "positive-mass"),
            Self::Hinge => write!(f, "hinge"),
        }
    }
}

/// Top-level bi-encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Whether query and passage encoders hold independent parameters.
    #[serde(default)]
    pub untie_encoder: bool,

    /// L2-normalize sentence embeddings before comparison.
    #[serde(default)]
    pub normalize: bool,

    /// Sentence pooling strategy.
    #[serde(default = "default_pooling_method")]
    pub pooling_method: PoolingMethod,

    /// Similarity temperature; scores are divided by this before the loss.
    /// Must be strictly positive.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Training-loss policy.
    #[serde(default = "default_loss_type")]
    pub loss_type: LossType,

    /// Scalar multiplier applied to the final training loss.
    #[serde(default = "default_contrastive_loss_weight")]
    pub contrastive_loss_weight: f32,
}

fn default_pooling_method() -> PoolingMethod {
    PoolingMethod::Cls
}

fn default_temperature() -> f32 {
    1.0
}

fn default_loss_type() -> LossType {
    LossType::Softmax
}

fn default_contrastive_loss_weight() -> f32 {
    1.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            untie_encoder: false,
            normalize: false,
            pooling_method: default_pooling_method(),
            temperature: default_temperature(),
            loss_type: default_loss_type(),
            contrastive_loss_weight: default_contrastive_loss_weight(),
        }
    }
}

impl ModelConfig {
    /// Validate the configuration, failing fast on invalid values.
    pub fn validate(&self) -> EncoderResult<()> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(EncoderError::ConfigError {
                message: format!(
                    "temperature must be strictly positive, got {}",
                    self.temperature
                ),
            });
        }
        if !self.contrastive_loss_weight.is_finite() {
            return Err(EncoderError::ConfigError {
                message: format!(
                    "contrastive_loss_weight must be finite, got {}",
                    self.contrastive_loss_weight
                ),
            });
        }
        Ok(())
    }
}

/// Shape and tying configuration for the [`DensePooler`](crate::pooler::DensePooler)
/// projection head. Persisted as a JSON sidecar next to the weights so a
/// loader can reconstruct an identically-shaped head without hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolerConfig {
    /// Backbone hidden dimension fed into the projection.
    pub input_dim: usize,
    /// Target embedding dimension.
    pub output_dim: usize,
    /// Whether query and passage sides share one parameter set.
    pub tied: bool,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            input_dim: 768,
            output_dim: 768,
            tied: true,
        }
    }
}

impl PoolerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> EncoderResult<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(EncoderError::ConfigError {
                message: format!(
                    "pooler dimensions must be nonzero, got {}x{}",
                    self.input_dim, self.output_dim
                ),
            });
        }
        Ok(())
    }
}
