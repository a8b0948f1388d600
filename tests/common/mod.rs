//! Shared fixtures: a deterministic stub backbone with real persistence,
//! and a mirror-world distributed context.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use bi_encoder::{
    BackboneLoader, DistributedContext, EncoderError, EncoderResult, TextBackbone, TokenBatch,
    INPUT_IDS,
};

pub const STUB_WEIGHTS_FILE: &str = "model.safetensors";
const TABLE_TENSOR: &str = "embeddings.weight";

/// Minimal encoder: an id-keyed embedding table, so every hidden state is
/// a deterministic function of its token id.
pub struct StubBackbone {
    table: Tensor,
    device: Device,
}

impl StubBackbone {
    pub fn deterministic(vocab: usize, hidden: usize, phase: usize) -> Self {
        let data: Vec<f32> = (0..vocab * hidden)
            .map(|i| ((i + phase * 31) as f32 * 0.7).sin() * 0.5)
            .collect();
        let device = Device::Cpu;
        let table = Tensor::from_vec(data, (vocab, hidden), &device).unwrap();
        Self { table, device }
    }

    fn from_table(table: Tensor) -> Self {
        let device = table.device().clone();
        Self { table, device }
    }
}

impl TextBackbone for StubBackbone {
    fn forward(&self, batch: &TokenBatch) -> EncoderResult<Tensor> {
        let ids = batch.get(INPUT_IDS).ok_or_else(|| EncoderError::MissingTensor {
            name: INPUT_IDS.to_string(),
        })?;
        let (batch_size, seq_len) = ids.dims2().map_err(map_candle)?;
        let flat = ids.flatten_all().map_err(map_candle)?;
        self.table
            .index_select(&flat, 0)
            .map_err(map_candle)?
            .reshape((batch_size, seq_len, self.hidden_size()))
            .map_err(map_candle)
    }

    fn hidden_size(&self) -> usize {
        self.table.dims()[1]
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn save_pretrained(&self, dir: &Path) -> EncoderResult<()> {
        let data: Vec<f32> = self
            .table
            .flatten_all()
            .map_err(map_candle)?
            .to_vec1()
            .map_err(map_candle)?;
        let view = safetensors::tensor::TensorView::new(
            safetensors::Dtype::F32,
            self.table.dims().to_vec(),
            bytemuck::cast_slice(&data),
        )
        .map_err(|e| EncoderError::SerializationError {
            message: e.to_string(),
        })?;
        safetensors::tensor::serialize_to_file(
            vec![(TABLE_TENSOR.to_string(), view)],
            &None::<HashMap<String, String>>,
            &dir.join(STUB_WEIGHTS_FILE),
        )
        .map_err(|e| EncoderError::SerializationError {
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn duplicate(&self) -> EncoderResult<Self> {
        Ok(Self::from_table(self.table.copy().map_err(map_candle)?))
    }
}

/// Loads stub backbones: a directory with saved weights restores them, any
/// other identifier yields a deterministic fresh table keyed by the name.
pub struct StubLoader {
    pub vocab: usize,
    pub hidden: usize,
}

impl BackboneLoader for StubLoader {
    type Backbone = StubBackbone;

    fn from_pretrained(&self, name_or_path: &str) -> EncoderResult<StubBackbone> {
        let weights = Path::new(name_or_path).join(STUB_WEIGHTS_FILE);
        if weights.exists() {
            let data = std::fs::read(&weights)?;
            let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
                EncoderError::SerializationError {
                    message: e.to_string(),
                }
            })?;
            let view = tensors
                .tensor(TABLE_TENSOR)
                .map_err(|e| EncoderError::SerializationError {
                    message: e.to_string(),
                })?;
            let shape: Vec<usize> = view.shape().to_vec();
            let floats: &[f32] = bytemuck::cast_slice(view.data());
            let table =
                Tensor::from_slice(floats, shape, &Device::Cpu).map_err(map_candle)?;
            Ok(StubBackbone::from_table(table))
        } else {
            let phase = name_or_path.bytes().map(usize::from).sum::<usize>();
            Ok(StubBackbone::deterministic(self.vocab, self.hidden, phase))
        }
    }
}

/// Every rank holds the same batch; gathered copies are detached, as a
/// real collective's would be.
pub struct MirrorWorld {
    pub rank: usize,
    pub world_size: usize,
}

impl DistributedContext for MirrorWorld {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn all_gather(&self, tensor: &Tensor) -> EncoderResult<Vec<Tensor>> {
        Ok((0..self.world_size).map(|_| tensor.detach()).collect())
    }
}

/// Token batch of shape `[rows, 2]` with an all-ones mask.
pub fn token_batch(ids: &[u32], rows: usize) -> TokenBatch {
    let device = Device::Cpu;
    let input_ids = Tensor::from_slice(ids, (rows, ids.len() / rows), &device).unwrap();
    let mask = Tensor::ones(input_ids.dims(), candle_core::DType::U32, &device).unwrap();
    TokenBatch::from_ids(input_ids, mask)
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: e.to_string(),
    }
}
