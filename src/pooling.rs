//! Sentence pooling: reduce a `[batch, seq_len, hidden]` hidden-state
//! sequence to one vector per sequence.

use candle_core::{DType, Tensor};

use crate::config::PoolingMethod;
use crate::error::{EncoderError, EncoderResult};

/// Pool token-level hidden states into sentence embeddings `[batch, hidden]`.
///
/// For [`PoolingMethod::Mean`], each example is averaged over its real
/// (unmasked) token positions only; callers guarantee every example has at
/// least one unmasked token. For [`PoolingMethod::Cls`], the first sequence
/// position is returned and the mask is ignored.
pub fn pool(
    hidden_states: &Tensor,
    attention_mask: &Tensor,
    method: PoolingMethod,
) -> EncoderResult<Tensor> {
    match method {
        PoolingMethod::Mean => {
            let mask = attention_mask
                .to_dtype(DType::F32)
                .map_err(map_candle)?;
            let expanded = mask.unsqueeze(2).map_err(map_candle)?;
            let summed = hidden_states
                .broadcast_mul(&expanded)
                .map_err(map_candle)?
                .sum(1)
                .map_err(map_candle)?;
            let counts = mask.sum_keepdim(1).map_err(map_candle)?;
            summed.broadcast_div(&counts).map_err(map_candle)
        }
        PoolingMethod::Cls => hidden_states
            .narrow(1, 0, 1)
            .map_err(map_candle)?
            .squeeze(1)
            .map_err(map_candle),
    }
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Pooling error: {}", e),
    }
}
