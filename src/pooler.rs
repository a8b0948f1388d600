//! Learned projection head applied after sentence pooling.
//!
//! `DensePooler` maps pooled embeddings from the backbone dimension to the
//! target embedding dimension. The query and passage sides either share
//! one parameter set (tied) or own two independent linear maps, chosen
//! once at construction.
//!
//! Persistence is a safetensors weight file plus a JSON sidecar recording
//! `input_dim`/`output_dim`/`tied`, so a loader can reconstruct an
//! identically-shaped head from the files alone.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};

use crate::config::PoolerConfig;
use crate::error::{EncoderError, EncoderResult};

/// Weight file written next to the model checkpoint.
pub const POOLER_WEIGHTS_FILE: &str = "pooler.safetensors";

/// Sidecar configuration record written next to the weights.
pub const POOLER_CONFIG_FILE: &str = "pooler_config.json";

/// Which encoder side a projection is applied for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Query,
    Passage,
}

/// One linear map: `y = x W^T + b` with `W: [output_dim, input_dim]`.
struct LinearHead {
    weight: Var,
    bias: Var,
}

impl LinearHead {
    /// Deterministic uniform init scaled by `1/sqrt(input_dim)`; the phase
    /// offset keeps independently-initialized heads distinct.
    fn init(input_dim: usize, output_dim: usize, phase: usize, device: &Device) -> EncoderResult<Self> {
        let scale = (1.0 / input_dim as f64).sqrt() as f32;
        let weight_data: Vec<f32> = (0..output_dim * input_dim)
            .map(|i| {
                let x = (((i + phase * 7919) as f32 * 0.618033988 + 0.31415926) % 1.0) * 2.0 - 1.0;
                x * scale
            })
            .collect();
        let weight_tensor = Tensor::from_vec(weight_data, (output_dim, input_dim), device)
            .map_err(map_candle)?;
        let weight = Var::from_tensor(&weight_tensor).map_err(map_candle)?;
        let bias_tensor = Tensor::zeros(output_dim, DType::F32, device).map_err(map_candle)?;
        let bias = Var::from_tensor(&bias_tensor).map_err(map_candle)?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> EncoderResult<Tensor> {
        x.matmul(&self.weight.as_tensor().t().map_err(map_candle)?)
            .map_err(map_candle)?
            .broadcast_add(self.bias.as_tensor())
            .map_err(map_candle)
    }

    fn restore(&mut self, weight: Tensor, bias: Tensor) -> EncoderResult<()> {
        check_shape(self.weight.as_tensor(), &weight)?;
        check_shape(self.bias.as_tensor(), &bias)?;
        self.weight.set(&weight).map_err(map_candle)?;
        self.bias.set(&bias).map_err(map_candle)?;
        Ok(())
    }
}

fn check_shape(expected: &Tensor, got: &Tensor) -> EncoderResult<()> {
    if expected.dims() != got.dims() {
        return Err(EncoderError::DimensionMismatch {
            expected: expected.elem_count(),
            got: got.elem_count(),
        });
    }
    Ok(())
}

/// Learned projection head with optionally-tied query/passage parameters.
pub struct DensePooler {
    query: LinearHead,
    /// Present only when untied; the tied case routes both sides through
    /// the query-side parameters.
    passage: Option<LinearHead>,
    config: PoolerConfig,
}

impl DensePooler {
    /// Construct a freshly-initialized head on the given device.
    pub fn new(config: &PoolerConfig, device: &Device) -> EncoderResult<Self> {
        config.validate()?;
        let query = LinearHead::init(config.input_dim, config.output_dim, 0, device)?;
        let passage = if config.tied {
            None
        } else {
            Some(LinearHead::init(config.input_dim, config.output_dim, 1, device)?)
        };
        Ok(Self {
            query,
            passage,
            config: *config,
        })
    }

    /// The shape/tying configuration this head was built with.
    pub fn config(&self) -> &PoolerConfig {
        &self.config
    }

    /// Whether both sides share one parameter set.
    pub fn is_tied(&self) -> bool {
        self.passage.is_none()
    }

    fn head_for(&self, side: Side) -> &LinearHead {
        match side {
            Side::Query => &self.query,
            Side::Passage => self.passage.as_ref().unwrap_or(&self.query),
        }
    }

    /// Project a pooled embedding for the given side.
    pub fn project(&self, embedding: &Tensor, side: Side) -> EncoderResult<Tensor> {
        self.head_for(side).forward(embedding)
    }

    /// Trainable parameters, for registration with an external optimizer.
    pub fn trainable_vars(&self) -> Vec<&Var> {
        let mut vars = vec![&self.query.weight, &self.query.bias];
        if let Some(passage) = &self.passage {
            vars.push(&passage.weight);
            vars.push(&passage.bias);
        }
        vars
    }

    /// Restore weights from `dir` if a checkpoint exists there.
    ///
    /// A missing weight file is the train-from-scratch path, not an error.
    pub fn load(&mut self, dir: &Path) -> EncoderResult<()> {
        let weights_path = dir.join(POOLER_WEIGHTS_FILE);
        if !weights_path.exists() {
            tracing::info!("No projection head checkpoint at {}, training from scratch", dir.display());
            return Ok(());
        }
        tracing::info!("Loading projection head from {}", weights_path.display());

        let data = std::fs::read(&weights_path)?;
        let safetensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
            EncoderError::SerializationError {
                message: format!("Failed to deserialize projection checkpoint: {}", e),
            }
        })?;

        let device = self.query.weight.as_tensor().device().clone();
        let load_tensor = |name: &str| -> EncoderResult<Tensor> {
            let view = safetensors
                .tensor(name)
                .map_err(|e| EncoderError::SerializationError {
                    message: format!("Missing projection tensor '{}': {}", name, e),
                })?;
            let shape: Vec<usize> = view.shape().to_vec();
            let float_data: &[f32] = bytemuck::cast_slice(view.data());
            Tensor::from_slice(float_data, shape, &device).map_err(map_candle)
        };

        let weight = load_tensor("pooler.query.weight")?;
        let bias = load_tensor("pooler.query.bias")?;
        self.query.restore(weight, bias)?;

        if let Some(passage) = &mut self.passage {
            let weight = load_tensor("pooler.passage.weight")?;
            let bias = load_tensor("pooler.passage.bias")?;
            passage.restore(weight, bias)?;
        }
        Ok(())
    }

    /// Persist weights and the sidecar configuration record into `dir`.
    pub fn save(&self, dir: &Path) -> EncoderResult<()> {
        std::fs::create_dir_all(dir)?;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(
            "pooler.query.weight".to_string(),
            self.query.weight.as_tensor().clone(),
        );
        tensors.insert(
            "pooler.query.bias".to_string(),
            self.query.bias.as_tensor().clone(),
        );
        if let Some(passage) = &self.passage {
            tensors.insert(
                "pooler.passage.weight".to_string(),
                passage.weight.as_tensor().clone(),
            );
            tensors.insert(
                "pooler.passage.bias".to_string(),
                passage.bias.as_tensor().clone(),
            );
        }

        let tensor_data: Vec<(String, Vec<f32>, Vec<usize>)> = tensors
            .iter()
            .map(|(k, v)| {
                let data: Vec<f32> = v
                    .flatten_all()
                    .map_err(map_candle)?
                    .to_vec1()
                    .map_err(map_candle)?;
                let shape: Vec<usize> = v.shape().dims().to_vec();
                Ok((k.clone(), data, shape))
            })
            .collect::<Result<Vec<_>, EncoderError>>()?;

        let views: Vec<(String, safetensors::tensor::TensorView<'_>)> = tensor_data
            .iter()
            .map(|(k, data, shape)| {
                let view = safetensors::tensor::TensorView::new(
                    safetensors::Dtype::F32,
                    shape.clone(),
                    bytemuck::cast_slice(data.as_slice()),
                )
                .map_err(|e| EncoderError::SerializationError {
                    message: format!("TensorView for '{}' failed: {}", k, e),
                })?;
                Ok((k.clone(), view))
            })
            .collect::<Result<Vec<_>, EncoderError>>()?;

        let weights_path = dir.join(POOLER_WEIGHTS_FILE);
        safetensors::tensor::serialize_to_file(
            views.iter().map(|(k, v)| (k.clone(), v.clone())),
            &None::<HashMap<String, String>>,
            &weights_path,
        )
        .map_err(|e| EncoderError::SerializationError {
            message: format!("Failed to save projection weights: {}", e),
        })?;

        let config_json =
            serde_json::to_string(&self.config).map_err(|e| EncoderError::SerializationError {
                message: format!("Failed to serialize projection config: {}", e),
            })?;
        std::fs::write(dir.join(POOLER_CONFIG_FILE), config_json)?;

        tracing::info!("Saved projection head to {}", weights_path.display());
        Ok(())
    }

    /// Whether `dir` holds both the weight file and the sidecar record.
    /// Both must exist for load auto-detection to trigger.
    pub fn checkpoint_exists(dir: &Path) -> bool {
        dir.join(POOLER_WEIGHTS_FILE).exists() && dir.join(POOLER_CONFIG_FILE).exists()
    }

    /// Reconstruct a head from a saved checkpoint: read the sidecar
    /// configuration, build an identically-shaped head, restore weights.
    pub fn load_with_config(dir: &Path, device: &Device) -> EncoderResult<Self> {
        let config_raw = std::fs::read_to_string(dir.join(POOLER_CONFIG_FILE))?;
        let config: PoolerConfig =
            serde_json::from_str(&config_raw).map_err(|e| EncoderError::SerializationError {
                message: format!("Failed to parse projection config: {}", e),
            })?;
        let mut pooler = Self::new(&config, device)?;
        pooler.load(dir)?;
        Ok(pooler)
    }
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Projection error: {}", e),
    }
}
