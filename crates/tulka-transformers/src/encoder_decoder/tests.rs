use ndarray::{array, s, Array1, Array2};

use super::*;
use crate::common::ExecutionMode;
use crate::lm_head::LmHeadWeight;
use crate::weights::WeightMap;

const EOS: u32 = 2;

fn tiny_config() -> TransformerConfig {
    TransformerConfig {
        num_layers: 2,
        num_heads: 2,
        hidden_size: 16,
        ff_size: Some(32),
        normalize_out: true,
        ..Default::default()
    }
}

fn tiny_vocab() -> VocabSpec {
    VocabSpec {
        inp_size: 12,
        out_size: 12,
        inp_eos: EOS,
        out_eos: EOS,
    }
}

fn tiny_model(seed: u64) -> Model {
    Model::random(tiny_config(), tiny_vocab(), seed).unwrap()
}

#[test]
fn test_encode_shapes_and_padding_mask() {
    let model = tiny_model(17);
    let inp = array![[5u32, 8, EOS]];

    let state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    assert_eq!(state.enc_out.shape(), &[1, 3, 16]);
    assert_eq!(state.enc_mask, array![[1.0_f32, 1.0, 1.0]]);

    // Lengths are inferred from the first end-of-sequence id.
    let padded = array![[5u32, EOS, 7, 7]];
    let state = model
        .encode(&padded, None, ExecutionMode::Inference)
        .unwrap();
    assert_eq!(state.enc_mask, array![[1.0_f32, 1.0, 0.0, 0.0]]);
}

#[test]
fn test_incremental_decode_matches_batch_scoring() {
    let model = tiny_model(99);
    let inp = array![[5u32, 8, EOS], [5, EOS, EOS]];
    let out = array![[4u32, 7, 9, EOS], [3, EOS, EOS, EOS]];

    let reference = model.score(&inp, &out, ExecutionMode::Inference).unwrap();
    assert_eq!(reference.shape(), &[2, 4, 12]);

    let mut state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();

    for t in 0..out.ncols() {
        let logits = model.logits_of(&state);
        for b in 0..2 {
            for v in 0..12 {
                let diff = (logits[[b, v]] - reference[[b, t, v]]).abs();
                assert!(
                    diff < 1e-4,
                    "step {} row {} vocab {}: incremental {} vs batch {}",
                    t,
                    b,
                    v,
                    logits[[b, v]],
                    reference[[b, t, v]]
                );
            }
        }

        let words = Array1::from_vec(vec![out[[0, t]], out[[1, t]]]);
        state = model
            .decode(&state, Some(&words), ExecutionMode::Inference)
            .unwrap();
    }
}

#[test]
fn test_cache_growth_invariant() {
    let model = tiny_model(7);
    let inp = array![[5u32, 8, EOS]];
    let n_inp = inp.ncols();

    // encode performs the initial zero-embedding step.
    let mut state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    assert_eq!(state.steps(), 1);
    assert_eq!(state.out_seq.ncols(), 0);

    for k in 1..=3 {
        let words = Array1::from_elem(1, 4u32);
        state = model
            .decode(&state, Some(&words), ExecutionMode::Inference)
            .unwrap();

        assert_eq!(state.steps(), k + 1);
        assert_eq!(state.out_seq.ncols(), k);
        assert_eq!(state.emb_cache.shape()[1], k + 1);
        for layer in 0..2 {
            assert_eq!(state.self_kv[layer].len(), k + 1);
            assert_eq!(state.layer_caches[layer].shape()[1], k + 1);
            // The cross cache never regrows past the encoder length.
            assert_eq!(state.cross_kv[layer].len(), n_inp);
        }
    }
}

#[test]
fn test_decode_is_a_functional_update() {
    let model = tiny_model(31);
    let inp = array![[5u32, 8, EOS]];
    let state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    let steps_before = state.steps();

    let words = Array1::from_elem(1, 6u32);
    let fork_a = model
        .decode(&state, Some(&words), ExecutionMode::Inference)
        .unwrap();
    let fork_b = model
        .decode(&state, Some(&words), ExecutionMode::Inference)
        .unwrap();

    // The parent state is untouched and both forks agree exactly.
    assert_eq!(state.steps(), steps_before);
    assert_eq!(model.logits_of(&fork_a), model.logits_of(&fork_b));
    assert_eq!(fork_a.offsets, &state.offsets + 1.0);
}

#[test]
fn test_tied_output_projection_aliases_embedding_table() {
    let config = TransformerConfig {
        tie_output_emb: true,
        ..tiny_config()
    };
    let model = Model::random(config, tiny_vocab(), 3).unwrap();

    match model.lm_head().weight() {
        LmHeadWeight::Tied(table) => {
            assert!(std::sync::Arc::ptr_eq(table, model.output_embedding_table()));
        }
        LmHeadWeight::Owned(_) => panic!("expected a tied projection"),
    }
}

#[test]
fn test_shared_embeddings_use_one_table() {
    let config = TransformerConfig {
        share_emb: true,
        tie_output_emb: true,
        ..tiny_config()
    };
    let model = Model::random(config, tiny_vocab(), 3).unwrap();

    // Input embedding, output embedding and the logits projection all
    // resolve to the same allocation.
    match model.lm_head().weight() {
        LmHeadWeight::Tied(table) => {
            assert!(std::sync::Arc::ptr_eq(table, model.output_embedding_table()));
        }
        LmHeadWeight::Owned(_) => panic!("expected a tied projection"),
    }
}

#[test]
fn test_bad_head_count_fails_at_construction() {
    let config = TransformerConfig {
        value_size: Some(21),
        ..tiny_config()
    };
    let err = Model::random(config, tiny_vocab(), 0).unwrap_err();
    assert!(err.to_string().contains("not divisible"));
}

/// A zero-layer model is small enough to spell out its entire checkpoint
/// by hand: two embedding tables and the output projection.
fn zero_layer_setup() -> (TransformerConfig, VocabSpec, WeightMap) {
    let config = TransformerConfig {
        num_layers: 0,
        num_heads: 1,
        hidden_size: 4,
        ..Default::default()
    };
    let vocab = VocabSpec {
        inp_size: 6,
        out_size: 5,
        inp_eos: EOS,
        out_eos: EOS,
    };

    let mut map = WeightMap::new();
    map.insert("emb_inp.weight", Array2::<f32>::zeros((6, 4)));
    map.insert("emb_out.weight", Array2::<f32>::zeros((5, 4)));
    map.insert("lm_head.weight", Array2::<f32>::zeros((4, 5)));
    // Bias strongly favors the end-of-sequence id.
    map.insert(
        "lm_head.bias",
        Array1::from_vec(vec![0.0_f32, 0.0, 5.0, 0.0, 0.0]),
    );
    (config, vocab, map)
}

#[test]
fn test_checkpoint_name_set_must_match_exactly() {
    let (config, vocab, map) = zero_layer_setup();
    assert!(Model::from_weights(config.clone(), vocab, map.clone()).is_ok());

    // An extra tensor the model never declared.
    let mut extra = map.clone();
    extra.insert("orphan.weight", Array2::<f32>::zeros((2, 2)));
    let err = Model::from_weights(config.clone(), vocab, extra).unwrap_err();
    assert!(err.to_string().contains("orphan.weight"));

    // A missing tensor.
    let mut missing = WeightMap::new();
    for name in map.names().filter(|n| *n != "lm_head.bias") {
        missing.insert(name, map.get(name).unwrap().clone());
    }
    let err = Model::from_weights(config, vocab, missing).unwrap_err();
    assert!(err.to_string().contains("lm_head.bias"));
}

#[test]
fn test_greedy_decode_terminates_at_eos_with_fixed_weights() {
    let (config, vocab, map) = zero_layer_setup();
    let model = Model::from_weights(config, vocab, map).unwrap();

    let inp = array![[5u32, 3, EOS]];
    let out = greedy_generate(&model, &inp, None, &GenerationConfig { max_length: 10 }).unwrap();

    // The biased projection emits end-of-sequence on the first step.
    assert_eq!(out, array![[EOS]]);
}

#[test]
fn test_greedy_generation_respects_max_length() {
    let model = tiny_model(55);
    let inp = array![[5u32, 8, EOS], [9, 4, EOS]];

    let config = GenerationConfig { max_length: 6 };
    let out = greedy_generate(&model, &inp, None, &config).unwrap();

    assert_eq!(out.nrows(), 2);
    assert!(out.ncols() <= 6);
    // Rows either terminated at end-of-sequence or ran to the cap.
    for row in out.outer_iter() {
        let hit_eos = row.iter().any(|&w| w == EOS);
        assert!(hit_eos || row.len() == 6);
    }
}

#[test]
fn test_explicit_lengths_override_inference() {
    let model = tiny_model(5);
    let inp = array![[5u32, 8, 7, 9]];

    let state = model
        .encode(&inp, Some(&[2]), ExecutionMode::Inference)
        .unwrap();
    assert_eq!(state.enc_mask, array![[1.0_f32, 1.0, 0.0, 0.0]]);
}

#[test]
fn test_random_offset_config_is_deterministic_at_inference() {
    let config = TransformerConfig {
        dst_rand_offset: true,
        ..tiny_config()
    };
    let model = Model::random(config, tiny_vocab(), 13).unwrap();
    let inp = array![[5u32, 8, EOS]];

    let a = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    let b = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    assert_eq!(model.logits_of(&a), model.logits_of(&b));
    assert_eq!(a.offsets, Array1::from_elem(1, 1.0));
}

#[test]
fn test_zero_layer_bypass_keeps_encoder_information() {
    // With no decoder layers the masked encoder mean is the only path
    // from source to target; different sources must give different
    // read-outs.
    let config = TransformerConfig {
        num_layers: 0,
        num_heads: 1,
        hidden_size: 4,
        ..Default::default()
    };
    let vocab = VocabSpec {
        inp_size: 6,
        out_size: 5,
        inp_eos: EOS,
        out_eos: EOS,
    };
    let model = Model::random(config, vocab, 21).unwrap();

    let a = model
        .encode(&array![[5u32, 3, EOS]], None, ExecutionMode::Inference)
        .unwrap();
    let b = model
        .encode(&array![[1u32, 4, EOS]], None, ExecutionMode::Inference)
        .unwrap();

    let diff: f32 = (&a.rdo - &b.rdo).iter().map(|v| v.abs()).sum();
    assert!(diff > 1e-6);
}

#[test]
fn test_score_rejects_mismatched_length_vector() {
    let model = tiny_model(2);
    let inp = array![[5u32, 8, EOS]];
    assert!(model
        .encode(&inp, Some(&[3, 3]), ExecutionMode::Inference)
        .is_err());
}

#[test]
fn test_state_consistency_violation_is_fatal() {
    let model = tiny_model(77);
    let inp = array![[5u32, 8, EOS]];
    let mut state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();

    // Corrupt one layer's cache length.
    state.self_kv[1] = crate::cache::KvCache::empty(1, 16, 16);

    let words = Array1::from_elem(1, 4u32);
    let err = model
        .decode(&state, Some(&words), ExecutionMode::Inference)
        .unwrap_err();
    assert!(err.to_string().contains("self-attention cache"));
}

#[test]
fn test_rescaled_embeddings_change_scale_only() {
    let config = TransformerConfig {
        rescale_emb: true,
        ..tiny_config()
    };
    let model = Model::random(config, tiny_vocab(), 41).unwrap();
    let inp = array![[5u32, 8, EOS]];
    let state = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    assert_eq!(state.enc_out.shape(), &[1, 3, 16]);
    assert!(state.enc_out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_decode_after_prefix_slices_match() {
    // Feeding a prefix one token at a time equals feeding it after a
    // fresh encode of the same input: the state machine has no hidden
    // dependence on call history beyond its caches.
    let model = tiny_model(63);
    let inp = array![[5u32, 8, EOS]];

    let mut s1 = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    for &w in &[4u32, 7] {
        s1 = model
            .decode(&s1, Some(&Array1::from_elem(1, w)), ExecutionMode::Inference)
            .unwrap();
    }

    let mut s2 = model.encode(&inp, None, ExecutionMode::Inference).unwrap();
    for &w in &[4u32, 7] {
        s2 = model
            .decode(&s2, Some(&Array1::from_elem(1, w)), ExecutionMode::Inference)
            .unwrap();
    }

    assert_eq!(s1.out_seq, s2.out_seq);
    let l1 = model.logits_of(&s1);
    let l2 = model.logits_of(&s2);
    for (a, b) in l1.iter().zip(l2.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    assert_eq!(s1.emb_cache.slice(s![.., 0, ..]), s2.emb_cache.slice(s![.., 0, ..]));
}
