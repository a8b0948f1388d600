//! The bi-encoder pair: two backbones (tied or untied), sentence pooling,
//! an optional projection head, and the training forward pass.
//!
//! One parameterized pipeline covers every loss regime; the loss policy is
//! a pluggable [`LossEngine`] selected by configuration.

use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;

use crate::backbone::{BackboneLoader, TextBackbone, TokenBatch};
use crate::config::{ModelConfig, PoolerConfig};
use crate::distributed::{DistributedContext, NegativeGather};
use crate::error::{EncoderError, EncoderResult};
use crate::loss::{LossEngine, TrainingTarget};
use crate::pooler::{DensePooler, Side};
use crate::pooling::pool;
use crate::scoring::{
    implicit_targets, l2_normalize, scaled_scores, scatter_teacher_targets, similarity,
};

/// Subdirectory holding the query-side backbone of an untied pair.
pub const QUERY_SUBDIR: &str = "query_model";

/// Subdirectory holding the passage-side backbone of an untied pair.
pub const PASSAGE_SUBDIR: &str = "passage_model";

/// Result of one forward call.
///
/// `scores` and `loss` are absent in pure-inference calls (one side's
/// input missing); `loss` is additionally absent in eval mode.
#[derive(Debug)]
pub struct EncoderOutput {
    pub q_reps: Option<Tensor>,
    pub p_reps: Option<Tensor>,
    pub scores: Option<Tensor>,
    pub loss: Option<Tensor>,
}

/// Dual-encoder retrieval model.
pub struct BiEncoder<B: TextBackbone> {
    lm_q: Arc<B>,
    lm_p: Arc<B>,
    pooler: Option<DensePooler>,
    loss: LossEngine,
    gather: Option<NegativeGather>,
    config: ModelConfig,
    training: bool,
}

impl<B: TextBackbone> BiEncoder<B> {
    /// Assemble a bi-encoder from already-constructed parts. Tied pairs
    /// pass the same `Arc` for both sides.
    pub fn new(
        lm_q: Arc<B>,
        lm_p: Arc<B>,
        pooler: Option<DensePooler>,
        config: ModelConfig,
        dist: Option<Arc<dyn DistributedContext>>,
    ) -> EncoderResult<Self> {
        config.validate()?;
        let gather = dist.map(NegativeGather::new).transpose()?;
        let loss = LossEngine::new(config.loss_type);
        Ok(Self {
            lm_q,
            lm_p,
            pooler,
            loss,
            gather,
            config,
            training: true,
        })
    }

    /// Build a trainable bi-encoder from a pretrained identifier or a
    /// local model directory.
    ///
    /// Local untied builds prefer `query_model/`/`passage_model/`
    /// subdirectories and fall back to two independent loads from the
    /// root; untied builds from a bare identifier deep-copy the loaded
    /// encoder for the passage side. An optional projection head is
    /// constructed from `pooler_config`, restoring saved weights from the
    /// model path when present. Starts in training mode.
    pub fn build<L>(
        loader: &L,
        model_name_or_path: &str,
        config: ModelConfig,
        pooler_config: Option<&PoolerConfig>,
        dist: Option<Arc<dyn DistributedContext>>,
    ) -> EncoderResult<Self>
    where
        L: BackboneLoader<Backbone = B>,
    {
        config.validate()?;
        let root = Path::new(model_name_or_path);

        let (lm_q, lm_p) = if root.is_dir() {
            if config.untie_encoder {
                let query_dir = root.join(QUERY_SUBDIR);
                let passage_dir = root.join(PASSAGE_SUBDIR);
                let (query_path, passage_path) = if query_dir.exists() {
                    (query_dir, passage_dir)
                } else {
                    (root.to_path_buf(), root.to_path_buf())
                };
                tracing::info!("Loading query encoder weights from {}", query_path.display());
                let lm_q = loader.from_pretrained(&query_path.to_string_lossy())?;
                tracing::info!(
                    "Loading passage encoder weights from {}",
                    passage_path.display()
                );
                let lm_p = loader.from_pretrained(&passage_path.to_string_lossy())?;
                (Arc::new(lm_q), Arc::new(lm_p))
            } else {
                tracing::info!("Loading tied encoder weights from {}", root.display());
                let lm = Arc::new(loader.from_pretrained(model_name_or_path)?);
                (Arc::clone(&lm), lm)
            }
        } else {
            tracing::info!("Loading pretrained encoder '{}'", model_name_or_path);
            let lm_q = loader.from_pretrained(model_name_or_path)?;
            if config.untie_encoder {
                let lm_p = lm_q.duplicate()?;
                (Arc::new(lm_q), Arc::new(lm_p))
            } else {
                let lm = Arc::new(lm_q);
                (Arc::clone(&lm), lm)
            }
        };

        let pooler = match pooler_config {
            Some(pooler_config) => {
                let mut pooler = DensePooler::new(pooler_config, lm_q.device())?;
                pooler.load(root)?;
                Some(pooler)
            }
            None => None,
        };

        Self::new(lm_q, lm_p, pooler, config, dist)
    }

    /// Load a bi-encoder for inference from a saved model directory.
    ///
    /// Untied weights are auto-detected from the `query_model/`
    /// subdirectory; a projection head is auto-detected from its weight
    /// file and sidecar configuration both being present. Starts in eval
    /// mode.
    pub fn load<L>(
        loader: &L,
        model_name_or_path: &str,
        mut config: ModelConfig,
    ) -> EncoderResult<Self>
    where
        L: BackboneLoader<Backbone = B>,
    {
        config.validate()?;
        let root = Path::new(model_name_or_path);
        let query_dir = root.join(QUERY_SUBDIR);

        let (lm_q, lm_p) = if root.is_dir() && query_dir.exists() {
            let passage_dir = root.join(PASSAGE_SUBDIR);
            tracing::info!("Found separate weights for query/passage encoders");
            tracing::info!("Loading query encoder weights from {}", query_dir.display());
            let lm_q = loader.from_pretrained(&query_dir.to_string_lossy())?;
            tracing::info!(
                "Loading passage encoder weights from {}",
                passage_dir.display()
            );
            let lm_p = loader.from_pretrained(&passage_dir.to_string_lossy())?;
            config.untie_encoder = true;
            (Arc::new(lm_q), Arc::new(lm_p))
        } else {
            tracing::info!("Loading tied encoder weights from {}", model_name_or_path);
            let lm = Arc::new(loader.from_pretrained(model_name_or_path)?);
            config.untie_encoder = false;
            (Arc::clone(&lm), lm)
        };

        let pooler = if DensePooler::checkpoint_exists(root) {
            tracing::info!("Found projection head weights and configuration");
            Some(DensePooler::load_with_config(root, lm_q.device())?)
        } else {
            None
        };

        let mut model = Self::new(lm_q, lm_p, pooler, config, None)?;
        model.training = false;
        Ok(model)
    }

    /// Persist the pair into `output_dir`.
    ///
    /// Untied pairs get `query_model/` and `passage_model/`
    /// subdirectories; creating one that already exists is an error that
    /// propagates. A projection head is always saved when present.
    pub fn save(&self, output_dir: &Path) -> EncoderResult<()> {
        std::fs::create_dir_all(output_dir)?;
        if self.config.untie_encoder {
            let query_dir = output_dir.join(QUERY_SUBDIR);
            let passage_dir = output_dir.join(PASSAGE_SUBDIR);
            std::fs::create_dir(&query_dir)?;
            std::fs::create_dir(&passage_dir)?;
            self.lm_q.save_pretrained(&query_dir)?;
            self.lm_p.save_pretrained(&passage_dir)?;
        } else {
            self.lm_q.save_pretrained(output_dir)?;
        }
        if let Some(pooler) = &self.pooler {
            pooler.save(output_dir)?;
        }
        tracing::info!("Saved bi-encoder to {}", output_dir.display());
        Ok(())
    }

    /// Toggle between training (loss-producing) and eval forward paths.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn pooler(&self) -> Option<&DensePooler> {
        self.pooler.as_ref()
    }

    fn encode(&self, batch: Option<&TokenBatch>, side: Side) -> EncoderResult<Option<Tensor>> {
        let Some(batch) = batch else {
            return Ok(None);
        };
        let backbone = match side {
            Side::Query => &self.lm_q,
            Side::Passage => &self.lm_p,
        };
        let hidden_states = backbone.forward(batch)?;
        let mask = batch.attention_mask()?;
        let mut reps = pool(&hidden_states, mask, self.config.pooling_method)?;
        if let Some(pooler) = &self.pooler {
            reps = pooler.project(&reps, side)?;
        }
        if self.config.normalize {
            reps = l2_normalize(&reps)?;
        }
        Ok(Some(reps.contiguous().map_err(map_candle)?))
    }

    /// Encode a query batch into sentence embeddings; `None` in, `None` out.
    pub fn encode_query(&self, batch: Option<&TokenBatch>) -> EncoderResult<Option<Tensor>> {
        self.encode(batch, Side::Query)
    }

    /// Encode a passage batch into sentence embeddings; `None` in, `None` out.
    pub fn encode_passage(&self, batch: Option<&TokenBatch>) -> EncoderResult<Option<Tensor>> {
        self.encode(batch, Side::Passage)
    }

    /// Full forward pass.
    ///
    /// With only one side's input this is pure inference: embeddings out,
    /// no scores, no loss. In eval mode with both sides the raw similarity
    /// matrix is returned without a loss. In training mode embeddings (and
    /// teacher scores, when supplied) are first gathered across processes
    /// if negative sharing is enabled, then scored and reduced to a loss.
    pub fn forward(
        &self,
        query: Option<&TokenBatch>,
        passage: Option<&TokenBatch>,
        teacher_scores: Option<&Tensor>,
    ) -> EncoderResult<EncoderOutput> {
        let q_reps = self.encode_query(query)?;
        let p_reps = self.encode_passage(passage)?;

        let (Some(q), Some(p)) = (&q_reps, &p_reps) else {
            return Ok(EncoderOutput {
                q_reps,
                p_reps,
                scores: None,
                loss: None,
            });
        };

        if !self.training {
            let scores = similarity(q, p)?;
            return Ok(EncoderOutput {
                q_reps,
                p_reps,
                scores: Some(scores),
                loss: None,
            });
        }

        let (q, p, teacher) = match &self.gather {
            Some(gather) => (
                gather.gather(q)?,
                gather.gather(p)?,
                gather.gather_opt(teacher_scores)?,
            ),
            None => (q.clone(), p.clone(), teacher_scores.cloned()),
        };

        let scores = scaled_scores(&q, &p, self.config.temperature)?;

        let loss = match &teacher {
            Some(teacher) => {
                let (rows, cols) = scores.dims2().map_err(map_candle)?;
                let target = scatter_teacher_targets(teacher, rows, cols)?;
                self.loss.compute(&scores, &TrainingTarget::Soft(target))?
            }
            None => {
                let queries = q.dim(0).map_err(map_candle)?;
                let passages = passage_count(&p)?;
                let target = implicit_targets(queries, passages, scores.device())?;
                self.loss.compute(&scores, &TrainingTarget::Classes(target))?
            }
        };

        let loss = if (self.config.contrastive_loss_weight - 1.0).abs() > f32::EPSILON {
            loss.affine(self.config.contrastive_loss_weight as f64, 0.0)
                .map_err(map_candle)?
        } else {
            loss
        };

        Ok(EncoderOutput {
            q_reps: Some(q),
            p_reps: Some(p),
            scores: Some(scores),
            loss: Some(loss),
        })
    }
}

/// Total passage vectors in a rank-2 `[P, D]` or candidate-block
/// `[B, C, D]` layout.
fn passage_count(p_reps: &Tensor) -> EncoderResult<usize> {
    let dims = p_reps.dims();
    if dims.is_empty() {
        return Err(EncoderError::TensorError {
            message: "passage embeddings must have at least one axis".to_string(),
        });
    }
    Ok(dims[..dims.len() - 1].iter().product())
}

fn map_candle(e: candle_core::Error) -> EncoderError {
    EncoderError::TensorError {
        message: format!("Encoder error: {}", e),
    }
}
