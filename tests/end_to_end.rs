//! Forward-path integration tests over the full encode → score → loss
//! pipeline, using a deterministic stub backbone.

mod common;

use std::sync::Arc;

use candle_core::{Device, Tensor};

use bi_encoder::{
    BiEncoder, DistributedContext, EncoderError, LossType, ModelConfig, PoolingMethod,
};
use common::{token_batch, MirrorWorld, StubBackbone};

const HIDDEN: usize = 6;

fn stub_pair(untied: bool, config: ModelConfig) -> BiEncoder<StubBackbone> {
    stub_pair_with_dist(untied, config, None)
}

fn stub_pair_with_dist(
    untied: bool,
    config: ModelConfig,
    dist: Option<Arc<dyn DistributedContext>>,
) -> BiEncoder<StubBackbone> {
    let lm_q = Arc::new(StubBackbone::deterministic(32, HIDDEN, 0));
    let lm_p = if untied {
        Arc::new(StubBackbone::deterministic(32, HIDDEN, 1))
    } else {
        Arc::clone(&lm_q)
    };
    BiEncoder::new(lm_q, lm_p, None, config, dist).unwrap()
}

fn scalar(t: &Tensor) -> f32 {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
}

#[test]
fn test_single_side_input_is_pure_inference() {
    let model = stub_pair(false, ModelConfig::default());
    let queries = token_batch(&[1, 2, 3, 4], 2);

    let output = model.forward(Some(&queries), None, None).unwrap();
    assert!(output.q_reps.is_some());
    assert!(output.p_reps.is_none());
    assert!(output.scores.is_none());
    assert!(output.loss.is_none());

    let output = model.forward(None, Some(&queries), None).unwrap();
    assert!(output.q_reps.is_none());
    assert!(output.p_reps.is_some());
    assert!(output.loss.is_none());
}

#[test]
fn test_eval_mode_returns_scores_without_loss() {
    let mut model = stub_pair(false, ModelConfig::default());
    model.set_training(false);
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10, 11, 12], 4);

    let output = model.forward(Some(&queries), Some(&passages), None).unwrap();
    let scores = output.scores.expect("eval mode must score");
    assert_eq!(scores.dims(), &[2, 4]);
    assert!(output.loss.is_none());
}

#[test]
fn test_softmax_loss_matches_manual_computation() {
    // 2 queries, 4 passages in contiguous blocks of 2: targets are columns 0 and 2
    let config = ModelConfig {
        pooling_method: PoolingMethod::Mean,
        temperature: 1.0,
        loss_type: LossType::Softmax,
        ..Default::default()
    };
    let model = stub_pair(false, config);
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10, 11, 12], 4);

    let q = model.encode_query(Some(&queries)).unwrap().unwrap();
    let p = model.encode_passage(Some(&passages)).unwrap().unwrap();
    let q_rows = q.to_vec2::<f32>().unwrap();
    let p_rows = p.to_vec2::<f32>().unwrap();

    let mut expected = 0.0f32;
    for (i, &target_col) in [0usize, 2].iter().enumerate() {
        let logits: Vec<f32> = p_rows
            .iter()
            .map(|p_row| q_rows[i].iter().zip(p_row).map(|(a, b)| a * b).sum())
            .collect();
        let max = logits.iter().cloned().fold(f32::MIN, f32::max);
        let denom: f32 = logits.iter().map(|v| (v - max).exp()).sum();
        expected += -((logits[target_col] - max).exp() / denom).ln();
    }
    expected /= 2.0;

    let output = model.forward(Some(&queries), Some(&passages), None).unwrap();
    let loss = scalar(&output.loss.expect("training mode must produce a loss"));
    assert!(
        (loss - expected).abs() < 1e-4,
        "loss {} vs manual {}",
        loss,
        expected
    );
}

#[test]
fn test_teacher_scores_drive_multi_softmax() {
    let config = ModelConfig {
        loss_type: LossType::MultiSoftmax,
        temperature: 0.5,
        ..Default::default()
    };
    let model = stub_pair(true, config);
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10, 11, 12], 4);
    let teacher =
        Tensor::from_slice(&[1.0f32, 0.0, 0.5, 0.5], (2, 2), &Device::Cpu).unwrap();

    let output = model
        .forward(Some(&queries), Some(&passages), Some(&teacher))
        .unwrap();
    let scores = output.scores.unwrap();
    assert_eq!(scores.dims(), &[2, 4]);
    let loss = scalar(&output.loss.unwrap());
    assert!(loss.is_finite() && loss > 0.0);
}

#[test]
fn test_unaligned_passage_count_is_rejected() {
    let model = stub_pair(false, ModelConfig::default());
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10], 3);

    let err = model
        .forward(Some(&queries), Some(&passages), None)
        .unwrap_err();
    assert!(matches!(err, EncoderError::UnalignedBatch { .. }));
}

#[test]
fn test_normalized_embeddings_are_unit_length() {
    let config = ModelConfig {
        normalize: true,
        ..Default::default()
    };
    let model = stub_pair(false, config);
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let reps = model.encode_query(Some(&queries)).unwrap().unwrap();
    for row in reps.to_vec2::<f32>().unwrap() {
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm {}", norm);
    }
}

#[test]
fn test_negative_gather_expands_the_batch() {
    let config = ModelConfig {
        loss_type: LossType::Softmax,
        ..Default::default()
    };
    let dist: Arc<dyn DistributedContext> = Arc::new(MirrorWorld {
        rank: 0,
        world_size: 2,
    });
    let model = stub_pair_with_dist(false, config, Some(dist));
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10, 11, 12], 4);

    let output = model.forward(Some(&queries), Some(&passages), None).unwrap();
    // 2 local queries x 2 ranks, 4 local passages x 2 ranks
    assert_eq!(output.q_reps.unwrap().dims()[0], 4);
    assert_eq!(output.scores.unwrap().dims(), &[4, 8]);
    assert!(scalar(&output.loss.unwrap()).is_finite());
}

#[test]
fn test_gathered_teacher_scores_stay_aligned() {
    let config = ModelConfig {
        loss_type: LossType::PositiveMass,
        ..Default::default()
    };
    let dist: Arc<dyn DistributedContext> = Arc::new(MirrorWorld {
        rank: 1,
        world_size: 2,
    });
    let model = stub_pair_with_dist(false, config, Some(dist));
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8, 9, 10, 11, 12], 4);
    let teacher =
        Tensor::from_slice(&[1.0f32, 0.0, 0.0, 1.0], (2, 2), &Device::Cpu).unwrap();

    let output = model
        .forward(Some(&queries), Some(&passages), Some(&teacher))
        .unwrap();
    assert_eq!(output.scores.unwrap().dims(), &[4, 8]);
    assert!(scalar(&output.loss.unwrap()).is_finite());
}

#[test]
fn test_contrastive_loss_weight_scales_the_loss() {
    let base = stub_pair(
        false,
        ModelConfig {
            contrastive_loss_weight: 1.0,
            ..Default::default()
        },
    );
    let doubled = stub_pair(
        false,
        ModelConfig {
            contrastive_loss_weight: 2.0,
            ..Default::default()
        },
    );
    let queries = token_batch(&[1, 2, 3, 4], 2);
    let passages = token_batch(&[5, 6, 7, 8], 2);

    let a = scalar(
        &base
            .forward(Some(&queries), Some(&passages), None)
            .unwrap()
            .loss
            .unwrap(),
    );
    let b = scalar(
        &doubled
            .forward(Some(&queries), Some(&passages), None)
            .unwrap()
            .loss
            .unwrap(),
    );
    assert!((b - 2.0 * a).abs() < 1e-5);
}

#[test]
fn test_tied_pair_encodes_both_sides_identically() {
    let model = stub_pair(false, ModelConfig::default());
    let batch = token_batch(&[1, 2, 3, 4], 2);
    let q = model.encode_query(Some(&batch)).unwrap().unwrap();
    let p = model.encode_passage(Some(&batch)).unwrap().unwrap();
    assert_eq!(q.to_vec2::<f32>().unwrap(), p.to_vec2::<f32>().unwrap());
}

#[test]
fn test_untied_pair_encodes_sides_differently() {
    let model = stub_pair(true, ModelConfig::default());
    let batch = token_batch(&[1, 2, 3, 4], 2);
    let q = model.encode_query(Some(&batch)).unwrap().unwrap();
    let p = model.encode_passage(Some(&batch)).unwrap().unwrap();
    assert_ne!(q.to_vec2::<f32>().unwrap(), p.to_vec2::<f32>().unwrap());
}
