//! Similarity matrix and training-target construction.
//!
//! Row `i` of every matrix produced here corresponds to query `i`'s
//! embedding. Targets come in two layouts: implicit single-positive class
//! indices (in-batch contrastive training with contiguous passage blocks
//! per query), and soft matrices scattered from an externally supplied
//! teacher relevance signal.

use candle_core::{Device, Tensor, D};

use crate::error::{EncoderError, EncoderResult};

/// Dot-product similarity between query and passage embeddings.
///
/// With rank-2 passages `[P, D]` this is a plain `Q @ P^T`. Higher-rank
/// passage layouts (per-query candidate blocks `[B, C, D]`) are compared
/// over the last two axes with batch broadcasting.
pub fn similarity(q_reps: &Tensor, p_reps: &Tensor) -> EncoderResult<Tensor> {
    if p_reps.dims().len() == 2 {
        q_reps
            .matmul(&p_reps.t().map_err(map_candle)?)
            .map_err(map_candle)
    } else {
        let transposed = p_reps
            .transpose(D::Minus2, D::Minus1)
            .map_err(map_candle)?;
        q_reps.broadcast_matmul(&transposed).map_err(map_candle)
    }
}

/// Temperature-scaled similarity reshaped to `[queries, -1]` for the loss.
///
/// The temperature has already been validated strictly positive by
/// [`ModelConfig::validate`](crate::config::ModelConfig::validate).
pub fn scaled_scores(q_reps: &Tensor, p_reps: &Tensor, temperature: f32) -> EncoderResult<Tensor> {
    let rows = q_reps.dim(0).map_err(map_candle)?;
    similarity(q_reps, p_reps)?
        .affine(1.0 / temperature as f64, 0.0)
        .map_err(map_candle)?
        .reshape((rows, ()))
        .map_err(map_candle)
}

/// L2-normalize embeddings along the last axis.
pub fn l2_normalize(reps: &Tensor) -> EncoderResult<Tensor> {
    let norm = reps
        .sqr()
        .map_err(map_candle)?
        .sum_keepdim(D::Minus1)
        .map_err(map_candle)?
        .sqrt()
        .map_err(map_candle)?
        .clamp(1e-12, f64::INFINITY)
        .map_err(map_candle)?;
    reps.broadcast_div(&norm).map_err(map_candle)
}

/// Class targets for single-positive in-batch training: `target[i] = i * k`
/// where `k = passages / queries`, assuming passages are laid out in
/// contiguous blocks of `k` per query.
///
/// A passage count that is not an exact multiple of the query count would
/// silently misalign every target, so it is rejected here.
pub fn implicit_targets(
    queries: usize,
    passages: usize,
    device: &Device,
) -> EncoderResult<Tensor> {
    if queries == 0 || passages % queries != 0 {
        return Err(EncoderError::UnalignedBatch { queries, passages });
    }
    let per_query = (passages / queries) as u32;
    let classes: Vec<u32> = (0..queries as u32).map(|i| i * per_query).collect();
    Tensor::from_vec(classes, queries, device).map_err(map_candle)
}

/// Scatter a teacher relevance matrix `[rows, n]` into a zero matrix of
/// shape `[rows, cols]`: row `i` receives the teacher's `n` values at
/// columns `[i*n, i*n + n)`, the candidate block belonging to query `i`.
/// All other positions stay zero.
pub fn scatter_teacher_targets(
    teacher_scores: &Tensor,
    rows: usize,
    cols: usize,
) -> EncoderResult<Tensor> {
    let (batch, per_query) = teacher_scores.dims2().map_err(map_candle)?;
    if batch != rows {
        return Err(EncoderError::DimensionMismatch {
            expected: rows,
            got: batch,
        });
    }
    if rows * per_query > cols {
        // Placement past the row width means the candidate count does not
        // match the configured negatives-per-query.
        return Err(EncoderError::DimensionMismatch {
            expected: cols,
            got: rows * per_query,
        });
    }

    let values = teacher_scores
        .to_dtype(candle_core::DType::F32)
        .map_err(map_candle)?
        .to_vec2::<f32>()
        .map_err(map_candle)?;
    let mut flat = vec![0.0f32; rows * cols];
    for (i, row) in values.iter().enumerate() {
        let start = i * cols + i * per_query;
        flat[start..start + per_query].copy_from_slice(row);
    }
    Tensor::from_vec(flat, (rows, cols), teacher_scores.device()).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Scoring error: {}", e),
    }
}
