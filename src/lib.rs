//! Dual-encoder retrieval model training.
//!
//! Two text encoders (query-side and passage-side, tied or untied) map
//! token batches into fixed-size sentence embeddings; relevance is scored
//! by dot-product similarity. Training supports single-positive in-batch
//! contrastive targets, teacher-distilled multi-positive soft targets,
//! four loss policies, and cross-device negative sharing for large-batch
//! contrastive training.
//!
//! # Architecture
//!
//! - [`TextBackbone`] / [`BackboneLoader`]: the opaque pretrained encoder
//!   and its factory
//! - [`pool`](pooling::pool): sentence pooling (mean / CLS)
//! - [`DensePooler`]: optional learned projection head with its own
//!   persistence (weights + JSON sidecar)
//! - [`scoring`]: similarity matrix and target construction
//! - [`LossEngine`]: pluggable loss policy
//! - [`NegativeGather`] / [`DistributedContext`]: cross-process negative
//!   pooling behind an injected capability
//! - [`BiEncoder`]: the pair itself: encode, build/load/save, forward
//!
//! # Example
//!
//! ```rust,ignore
//! use bi_encoder::{BiEncoder, ModelConfig, PoolerConfig};
//!
//! let config = ModelConfig {
//!     untie_encoder: true,
//!     temperature: 0.05,
//!     ..Default::default()
//! };
//! let model = BiEncoder::build(&loader, "models/base", config, None, None)?;
//! let output = model.forward(Some(&queries), Some(&passages), None)?;
//! let loss = output.loss.expect("training mode with both sides");
//! ```

pub mod backbone;
pub mod config;
pub mod distributed;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod pooler;
pub mod pooling;
pub mod scoring;

pub use backbone::{BackboneLoader, TextBackbone, TokenBatch, ATTENTION_MASK, INPUT_IDS};
pub use config::{LossType, ModelConfig, PoolerConfig, PoolingMethod};
pub use distributed::{DistributedContext, NegativeGather, SingleProcess};
pub use encoder::{BiEncoder, EncoderOutput, PASSAGE_SUBDIR, QUERY_SUBDIR};
pub use error::{EncoderError, EncoderResult};
pub use loss::{LossEngine, TrainingTarget};
pub use pooler::{DensePooler, Side, POOLER_CONFIG_FILE, POOLER_WEIGHTS_FILE};
pub use pooling::pool;
