//! Cross-device negative sharing for multi-process contrastive training.
//!
//! Every participating process contributes its in-flight embeddings so
//! each process's loss sees the full union of in-batch negatives. The
//! distributed runtime is an injected capability, so the gather logic is
//! testable without a real multi-process launch.
//!
//! Collective discipline is the caller's: all processes must call gather
//! the same number of times per step, and the exchange blocks until every
//! process has contributed.

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{EncoderError, EncoderResult};

/// Capability handle onto a multi-process training runtime.
pub trait DistributedContext: Send + Sync {
    /// This process's rank in `[0, world_size)`.
    fn rank(&self) -> usize;

    /// Number of participating processes.
    fn world_size(&self) -> usize;

    /// Whether the runtime has been initialized and collectives may run.
    fn is_initialized(&self) -> bool;

    /// Exchange a tensor with every process; returns one tensor per rank,
    /// in rank order. Received tensors carry no gradient history.
    fn all_gather(&self, tensor: &Tensor) -> EncoderResult<Vec<Tensor>>;
}

/// Trivial single-process context: rank 0 of 1, gather returns the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl DistributedContext for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn all_gather(&self, tensor: &Tensor) -> EncoderResult<Vec<Tensor>> {
        Ok(vec![tensor.clone()])
    }
}

/// Expands the effective negative pool by concatenating every process's
/// embeddings along the batch axis.
pub struct NegativeGather {
    ctx: Arc<dyn DistributedContext>,
}

impl std::fmt::Debug for NegativeGather {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegativeGather")
            .field("rank", &self.ctx.rank())
            .field("world_size", &self.ctx.world_size())
            .finish()
    }
}

impl NegativeGather {
    /// Construct a gatherer. Fails fast if the distributed runtime has not
    /// been initialized.
    pub fn new(ctx: Arc<dyn DistributedContext>) -> EncoderResult<Self> {
        if !ctx.is_initialized() {
            return Err(EncoderError::ConfigError {
                message: "distributed runtime has not been initialized for representation gathering"
                    .to_string(),
            });
        }
        Ok(Self { ctx })
    }

    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    pub fn world_size(&self) -> usize {
        self.ctx.world_size()
    }

    /// Gather a tensor from all processes and concatenate in rank order.
    ///
    /// The slot belonging to this process is overwritten with the original
    /// local tensor: the copy received back through the exchange carries
    /// no gradient history, while the original keeps the local computation
    /// graph intact.
    pub fn gather(&self, tensor: &Tensor) -> EncoderResult<Tensor> {
        let local = tensor.contiguous().map_err(map_candle)?;
        let mut slots = self.ctx.all_gather(&local)?;
        if slots.len() != self.ctx.world_size() {
            return Err(EncoderError::DimensionMismatch {
                expected: self.ctx.world_size(),
                got: slots.len(),
            });
        }
        slots[self.ctx.rank()] = local;
        let refs: Vec<&Tensor> = slots.iter().collect();
        Tensor::cat(&refs, 0).map_err(map_candle)
    }

    /// [`gather`](Self::gather) that passes `None` through unchanged.
    pub fn gather_opt(&self, tensor: Option<&Tensor>) -> EncoderResult<Option<Tensor>> {
        match tensor {
            Some(t) => Ok(Some(self.gather(t)?)),
            None => Ok(None),
        }
    }
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Negative gather error: {}", e),
    }
}
