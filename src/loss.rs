//! Loss policies over a (similarity, target) pair.
//!
//! Four selectable regimes:
//! 1. Softmax cross-entropy (single in-batch positive per query)
//! 2. Multi-label cross-entropy averaged over rows with nonzero loss
//! 3. Positive-mass log-loss over rows that have at least one positive
//! 4. Hinge loss (margin 0.5) over the binarized, flattened target
//!
//! Degenerate batches (no row with a valid target anywhere) return an
//! exact-zero loss that stays connected to the autograd graph, never a
//! detached constant and never NaN.

use candle_core::{Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

use crate::config::LossType;
use crate::error::{EncoderError, EncoderResult};

/// Hinge margin used by [`LossType::Hinge`].
const HINGE_MARGIN: f64 = 0.5;

/// Floor applied to the positive softmax mass before taking its log.
const POSITIVE_MASS_FLOOR: f64 = 1e-9;

/// Supervision for one training step.
pub enum TrainingTarget {
    /// Integer class index per query row (u32, `[rows]`); the implicit
    /// single-positive layout.
    Classes(Tensor),
    /// Float relevance matrix with the similarity matrix's shape; graded
    /// values are allowed, zero means irrelevant.
    Soft(Tensor),
}

/// Computes a scalar training loss under the configured policy.
pub struct LossEngine {
    loss_type: LossType,
}

impl LossEngine {
    pub fn new(loss_type: LossType) -> Self {
        Self { loss_type }
    }

    /// The configured policy.
    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    /// Compute the loss for a scored batch.
    ///
    /// Pairings of a loss policy with a target layout it cannot consume
    /// (e.g. multi-label losses with class-index targets) are rejected as
    /// configuration errors rather than producing shape-dependent garbage.
    pub fn compute(&self, scores: &Tensor, target: &TrainingTarget) -> EncoderResult<Tensor> {
        match (self.loss_type, target) {
            (LossType::Softmax, TrainingTarget::Classes(classes)) => {
                candle_nn::loss::cross_entropy(scores, classes).map_err(map_candle)
            }
            (LossType::Softmax, TrainingTarget::Soft(target)) => {
                soft_cross_entropy_rows(scores, target)?
                    .mean_all()
                    .map_err(map_candle)
            }
            (LossType::MultiSoftmax, TrainingTarget::Soft(target)) => {
                multi_label_cross_entropy(scores, target)
            }
            (LossType::PositiveMass, TrainingTarget::Soft(target)) => {
                positive_mass_loss(scores, target)
            }
            (LossType::Hinge, TrainingTarget::Soft(target)) => hinge_loss(scores, target),
            (loss_type, TrainingTarget::Classes(_)) => Err(EncoderError::ConfigError {
                message: format!(
                    "loss type '{}' requires a soft target matrix, got class indices",
                    loss_type
                ),
            }),
        }
    }
}

/// Per-row soft-label cross-entropy: `-(target · log_softmax(scores))`,
/// no reduction. Returns `[rows]`.
fn soft_cross_entropy_rows(scores: &Tensor, target: &Tensor) -> EncoderResult<Tensor> {
    let log_probs = log_softmax(scores, D::Minus1).map_err(map_candle)?;
    target
        .mul(&log_probs)
        .map_err(map_candle)?
        .sum(D::Minus1)
        .map_err(map_candle)?
        .neg()
        .map_err(map_candle)
}

/// Multi-label cross-entropy, averaged over the rows whose loss is
/// nonzero. A batch where every row's loss is exactly zero yields a zero
/// loss that still participates in the gradient graph.
fn multi_label_cross_entropy(scores: &Tensor, target: &Tensor) -> EncoderResult<Tensor> {
    let row_losses = soft_cross_entropy_rows(scores, target)?;
    let values: Vec<f32> = row_losses
        .detach()
        .to_vec1()
        .map_err(map_candle)?;
    let nonzero = values.iter().filter(|&&v| v != 0.0).count();
    let total = row_losses.sum_all().map_err(map_candle)?;
    if nonzero == 0 {
        // `sum * 0`: exact-zero loss that stays in the autograd graph.
        // `affine(0.0, _)` constant-folds and detaches under candle 0.9, so
        // multiply by a zero tensor instead to preserve graph connectivity.
        total
            .broadcast_mul(&total.zeros_like().map_err(map_candle)?)
            .map_err(map_candle)
    } else {
        total.affine(1.0 / nonzero as f64, 0.0).map_err(map_candle)
    }
}

/// Negative log of the softmax mass placed on positive candidates,
/// averaged over rows whose target row-sum is positive. The mass is
/// floored at 1e-9 before the log. No qualifying rows yields a
/// gradient-carrying zero.
fn positive_mass_loss(scores: &Tensor, target: &Tensor) -> EncoderResult<Tensor> {
    let row_sums: Vec<f32> = target
        .sum(D::Minus1)
        .map_err(map_candle)?
        .to_vec1()
        .map_err(map_candle)?;
    let retained: Vec<u32> = row_sums
        .iter()
        .enumerate()
        .filter(|(_, &sum)| sum > 0.0)
        .map(|(i, _)| i as u32)
        .collect();

    if retained.is_empty() {
        // `sum * 0`: gradient-preserving zero. `affine(0.0, _)` detaches the
        // graph under candle 0.9, so multiply by a zero tensor instead.
        let summed = scores.sum_all().map_err(map_candle)?;
        return summed
            .broadcast_mul(&summed.zeros_like().map_err(map_candle)?)
            .map_err(map_candle);
    }

    let indices = Tensor::from_vec(retained.clone(), retained.len(), scores.device())
        .map_err(map_candle)?;
    let kept_scores = scores.index_select(&indices, 0).map_err(map_candle)?;
    let kept_target = target.index_select(&indices, 0).map_err(map_candle)?;

    let probs = softmax(&kept_scores, D::Minus1).map_err(map_candle)?;
    let mass = probs
        .mul(&kept_target)
        .map_err(map_candle)?
        .sum(D::Minus1)
        .map_err(map_candle)?
        .clamp(POSITIVE_MASS_FLOOR, 1.0)
        .map_err(map_candle)?;
    mass.log()
        .map_err(map_candle)?
        .neg()
        .map_err(map_candle)?
        .mean_all()
        .map_err(map_candle)
}

/// Hinge loss over the fully flattened batch. The target is treated as a
/// binary positive indicator: labels become `target*2 - 1`, distances are
/// `1 - score`, and each element contributes `distance` for a positive
/// label or `max(0, margin - distance)` for a negative one.
fn hinge_loss(scores: &Tensor, target: &Tensor) -> EncoderResult<Tensor> {
    let positive = target.flatten_all().map_err(map_candle)?;
    let distance = scores
        .affine(-1.0, 1.0)
        .map_err(map_candle)?
        .flatten_all()
        .map_err(map_candle)?;

    let zeros = distance.zeros_like().map_err(map_candle)?;
    let margin_term = distance
        .affine(-1.0, HINGE_MARGIN)
        .map_err(map_candle)?
        .maximum(&zeros)
        .map_err(map_candle)?;

    let positive_part = positive.mul(&distance).map_err(map_candle)?;
    let negative_part = positive
        .affine(-1.0, 1.0)
        .map_err(map_candle)?
        .mul(&margin_term)
        .map_err(map_candle)?;
    positive_part
        .add(&negative_part)
        .map_err(map_candle)?
        .mean_all()
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Loss computation error: {}", e),
    }
}
