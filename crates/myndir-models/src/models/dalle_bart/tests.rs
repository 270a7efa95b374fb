use super::*;
use crate::error::DalleError;
use approx::assert_abs_diff_eq;
use myndir_transformers::common::CancellationToken;
use myndir_transformers::linear_layer::LinearLayer;
use myndir_transformers::normalization::LayerNorm;
use ndarray::{Array1, Array2, Array3, array, s};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn small_config(image_vocab_size: usize, image_token_count: usize, sample_token_count: usize) -> DalleBartDecoderConfig {
    DalleBartDecoderConfig {
        image_vocab_size,
        image_token_count,
        sample_token_count,
        embed_count: 16,
        attention_head_count: 4,
        glu_embed_count: 24,
        layer_count: 2,
        start_token: None,
        pad_token: 1,
        condition_factor: 10.0,
        layer_norm_eps: 1e-5,
        activation: Default::default(),
        is_verbose: false,
    }
}

fn random_decoder(config: DalleBartDecoderConfig, seed: u64) -> DalleBartDecoder {
    DalleBartDecoder::random(config, &mut StdRng::seed_from_u64(seed)).unwrap()
}

fn prompt(embed_count: usize) -> (Array2<u32>, Array3<f32>) {
    let text_tokens = array![[0u32, 57, 301, 12, 2, 1, 1], [0, 2, 1, 1, 1, 1, 1]];
    let mut rng = StdRng::seed_from_u64(99);
    let encoder_state = synthetic_encoder_state(&mut rng, text_tokens.ncols(), embed_count).unwrap();
    (text_tokens, encoder_state)
}

/// A decoder whose output is constant: the final norm maps everything to ones
/// and the head turns that into logit 1000 for `winner`, 0 elsewhere.
fn rigged_decoder(config: DalleBartDecoderConfig, winner: usize) -> DalleBartDecoder {
    let mut weights = DalleBartDecoderWeights::random(&config, &mut StdRng::seed_from_u64(5)).unwrap();
    let (vocab, embed) = (config.decoder_vocab_size(), config.embed_count);

    weights.final_ln = LayerNorm::new(Array1::zeros(embed), Array1::ones(embed), config.layer_norm_eps);
    let mut head = Array2::<f32>::zeros((vocab, embed));
    head.row_mut(winner).fill(1000.0 / embed as f32);
    weights.lm_head = LinearLayer::from(head);

    DalleBartDecoder::new(config, weights).unwrap()
}

#[test]
fn test_end_to_end_overwhelming_token() {
    let config = small_config(16, 4, 4);
    let decoder = rigged_decoder(config, 7);
    let (text_tokens, encoder_state) = prompt(16);

    let mut cache = decoder.new_cache();
    let mut rng = StdRng::seed_from_u64(1);
    let tokens = decoder
        .generate_in(
            &text_tokens,
            &encoder_state,
            &mut cache,
            &mut rng,
            &CancellationToken::never(),
            |_| {},
        )
        .unwrap();

    assert_eq!(tokens, vec![7, 7, 7, 7]);

    // Every slot of every layer was written exactly once.
    for layer in 0..cache.num_layers() {
        assert_eq!(cache.written(layer), 4);
        let (k, v) = cache.get(layer).unwrap();
        for p in 0..4 {
            assert!(k.slice(s![.., p, ..]).iter().any(|&x| x != 0.0));
            assert!(v.slice(s![.., p, ..]).iter().any(|&x| x != 0.0));
        }
    }
}

#[test]
fn test_short_run_leaves_later_slots_untouched() {
    let config = small_config(16, 6, 4);
    let decoder = rigged_decoder(config, 7);
    let (text_tokens, encoder_state) = prompt(16);

    let mut cache = decoder.new_cache();
    let tokens = decoder
        .generate_in(
            &text_tokens,
            &encoder_state,
            &mut cache,
            &mut StdRng::seed_from_u64(2),
            &CancellationToken::never(),
            |_| {},
        )
        .unwrap();

    assert_eq!(tokens, vec![7, 7, 7, 7]);
    for (k, v) in cache.layers() {
        assert!(k.slice(s![.., 4.., ..]).iter().all(|&x| x == 0.0));
        assert!(v.slice(s![.., 4.., ..]).iter().all(|&x| x == 0.0));
    }
    assert_eq!(cache.get_seq_length(), 4);
}

#[test]
fn test_sequence_length_and_token_range() {
    let config = small_config(30, 8, 5);
    let decoder = random_decoder(config, 3);
    let (text_tokens, encoder_state) = prompt(16);

    let tokens = decoder
        .generate(&text_tokens, &encoder_state, &mut StdRng::seed_from_u64(4))
        .unwrap();

    assert_eq!(tokens.len(), 5);
    assert!(tokens.iter().all(|&t| t <= 30));
}

#[test]
fn test_seeded_generation_is_reproducible() {
    let config = small_config(64, 6, 6);
    let decoder = random_decoder(config, 8);
    let (text_tokens, encoder_state) = prompt(16);

    let a = decoder.generate_seeded(&text_tokens, &encoder_state, 1234).unwrap();
    let b = decoder.generate_seeded(&text_tokens, &encoder_state, 1234).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_causal_visibility_in_every_layer() {
    let config = small_config(32, 5, 5);
    let decoder = random_decoder(config, 10);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();

    let mut token = decoder.config().start_token();
    for step in 0..5 {
        let trace = decoder
            .decode_traced(token, step, &text_tokens, &encoder_state, &mut cache)
            .unwrap();
        assert_eq!(trace.attention.len(), 2);

        for probs in &trace.attention {
            let p = &probs.self_attn;
            assert_eq!(p.shape(), &[2, 4, 1, 5]);
            for b in 0..2 {
                for h in 0..4 {
                    for j in step + 1..5 {
                        assert_eq!(p[[b, h, 0, j]], 0.0);
                    }
                    let visible: f32 = (0..=step).map(|j| p[[b, h, 0, j]]).sum();
                    assert_abs_diff_eq!(visible, 1.0, epsilon = 1e-5);
                }
            }
        }
        token = (step as u32 * 3) % 32;
    }
}

#[test]
fn test_cache_entries_are_write_once() {
    let config = small_config(32, 5, 5);
    let decoder = random_decoder(config, 11);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();

    decoder
        .decode_step(32, 0, &text_tokens, &encoder_state, &mut cache)
        .unwrap();
    decoder
        .decode_step(4, 1, &text_tokens, &encoder_state, &mut cache)
        .unwrap();
    let snapshot = cache.clone();

    for (step, token) in [(2, 9u32), (3, 0), (4, 31)] {
        decoder
            .decode_step(token, step, &text_tokens, &encoder_state, &mut cache)
            .unwrap();
    }

    for layer in 0..2 {
        let (k_then, v_then) = snapshot.get(layer).unwrap();
        let (k_now, v_now) = cache.get(layer).unwrap();
        assert_eq!(k_then.slice(s![.., 0..2, ..]), k_now.slice(s![.., 0..2, ..]));
        assert_eq!(v_then.slice(s![.., 0..2, ..]), v_now.slice(s![.., 0..2, ..]));
    }

    // Replaying an already written step is refused.
    let err = decoder
        .decode_step(4, 1, &text_tokens, &encoder_state, &mut cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::Step { step: 1, .. }));
}

#[test]
fn test_cross_attention_ignores_pad_positions() {
    let config = small_config(32, 3, 3);
    let decoder = random_decoder(config, 12);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();

    let trace = decoder
        .decode_traced(32, 0, &text_tokens, &encoder_state, &mut cache)
        .unwrap();

    for probs in &trace.attention {
        let p = &probs.cross_attn;
        for h in 0..4 {
            for j in 0..text_tokens.ncols() {
                for b in 0..2 {
                    if text_tokens[[b, j]] == 1 {
                        assert_eq!(p[[b, h, 0, j]], 0.0);
                    }
                }
            }
        }
    }
}

#[test]
fn test_guidance_blend_of_raw_logits() {
    let (text_tokens, encoder_state) = prompt(16);

    let config = small_config(32, 3, 3);
    let decoder = random_decoder(config.clone(), 13);
    let trace = decoder
        .decode_traced(32, 0, &text_tokens, &encoder_state, &mut decoder.new_cache())
        .unwrap();
    assert_eq!(trace.logits.shape(), &[2, 33]);
    for i in 0..33 {
        let expected = 10.0 * trace.logits[[0, i]] - 9.0 * trace.logits[[1, i]];
        assert_abs_diff_eq!(trace.blended[i], expected, epsilon = 1e-3);
    }

    // a = 1 keeps the conditional row, a = 0 the unconditional one.
    let cond_only = random_decoder(config.clone().with_condition_factor(1.0), 13);
    let blended = cond_only
        .decode_logits(32, 0, &text_tokens, &encoder_state, &mut cond_only.new_cache())
        .unwrap();
    assert_eq!(blended, trace.logits.row(0));

    let uncond_only = random_decoder(config.with_condition_factor(0.0), 13);
    let blended = uncond_only
        .decode_logits(32, 0, &text_tokens, &encoder_state, &mut uncond_only.new_cache())
        .unwrap();
    assert_eq!(blended, trace.logits.row(1));
}

#[test]
fn test_decode_step_keeps_fifty_candidates() {
    let config = small_config(200, 3, 3);
    let decoder = random_decoder(config, 14);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();

    let blended = decoder
        .decode_logits(200, 0, &text_tokens, &encoder_state, &mut cache.clone())
        .unwrap();
    let weights = decoder
        .decode_step(200, 0, &text_tokens, &encoder_state, &mut cache)
        .unwrap();

    assert_eq!(weights.len(), 201);
    let kept = weights.iter().filter(|&&w| w > 0.0).count();
    assert!(kept >= 50);

    let mut sorted = blended.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let cutoff = sorted[49];
    for (w, l) in weights.iter().zip(blended.iter()) {
        if *l < cutoff {
            assert_eq!(*w, 0.0);
        }
    }
    assert_abs_diff_eq!(weights.fold(0.0f32, |a, &b| a.max(b)), 1.0);
}

#[test]
fn test_decoding_is_deterministic() {
    let config = small_config(32, 4, 4);
    let decoder = random_decoder(config, 15);
    let (text_tokens, encoder_state) = prompt(16);

    let run = || {
        let mut cache = decoder.new_cache();
        decoder
            .decode_logits(32, 0, &text_tokens, &encoder_state, &mut cache)
            .unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_step_input_errors() {
    let config = small_config(32, 4, 4);
    let decoder = random_decoder(config, 16);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();

    let err = decoder
        .decode_step(32, 4, &text_tokens, &encoder_state, &mut cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::StepOutOfRange { step: 4, capacity: 4 }));

    let err = decoder
        .decode_step(33, 0, &text_tokens, &encoder_state, &mut cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::TokenOutOfRange { token: 33, max: 32 }));

    let one_branch = text_tokens.slice(s![0..1, ..]).to_owned();
    let err = decoder
        .decode_step(32, 0, &one_branch, &encoder_state, &mut cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::BranchCount { expected: 2, actual: 1 }));

    let narrow = Array3::<f32>::zeros((2, text_tokens.ncols(), 8));
    let err = decoder
        .decode_step(32, 0, &text_tokens, &narrow, &mut cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::ShapeMismatch { .. }));

    let mut wrong_cache = myndir_transformers::CpuKVCache::new(3, 2, 4, 16);
    let err = decoder
        .decode_step(32, 0, &text_tokens, &encoder_state, &mut wrong_cache)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::ShapeMismatch { ref component, .. } if component == "kv cache"));

    // Nothing was written by the rejected calls.
    assert_eq!(cache.get_seq_length(), 0);
}

#[test]
fn test_construction_rejects_mismatched_weights() {
    let config = small_config(32, 4, 4);
    let mut rng = StdRng::seed_from_u64(17);

    let mut weights = DalleBartDecoderWeights::random(&config, &mut rng).unwrap();
    weights.layers.pop();
    assert!(matches!(
        DalleBartDecoder::new(config.clone(), weights),
        Err(DalleError::ShapeMismatch { .. })
    ));

    let mut weights = DalleBartDecoderWeights::random(&config, &mut rng).unwrap();
    weights.lm_head = LinearLayer::zeros(32, 16);
    let err = DalleBartDecoder::new(config.clone(), weights).err().unwrap();
    assert!(err.to_string().contains("lm_head"));

    let mut weights = DalleBartDecoderWeights::random(&config, &mut rng).unwrap();
    weights.embed_positions = Array2::zeros((3, 16));
    assert!(DalleBartDecoder::new(config.clone(), weights).is_err());

    let mut weights = DalleBartDecoderWeights::random(&config, &mut rng).unwrap();
    weights.lm_head = LinearLayer::new_f32(Array2::zeros((33, 16)), Array1::<f32>::zeros(33));
    assert!(DalleBartDecoder::new(config.clone(), weights).is_err());

    let mut bad = config;
    bad.attention_head_count = 3;
    assert!(matches!(
        DalleBartDecoderWeights::random(&bad, &mut rng),
        Err(DalleError::InvalidConfig(_))
    ));
}

#[test]
fn test_degenerate_distribution_is_fatal() {
    let config = small_config(16, 4, 4);
    let mut weights = DalleBartDecoderWeights::random(&config, &mut StdRng::seed_from_u64(18)).unwrap();
    weights.lm_head = LinearLayer::from(Array2::from_elem((17, 16), f32::NAN));
    let decoder = DalleBartDecoder::new(config, weights).unwrap();
    let (text_tokens, encoder_state) = prompt(16);

    let err = decoder
        .generate_seeded(&text_tokens, &encoder_state, 0)
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::DegenerateDistribution { step: 0, .. }));
}

#[test]
fn test_streaming_and_cancellation() {
    let config = small_config(16, 6, 6);
    let decoder = rigged_decoder(config, 3);
    let (text_tokens, encoder_state) = prompt(16);

    let mut streamed = Vec::new();
    let tokens = decoder
        .generate_in(
            &text_tokens,
            &encoder_state,
            &mut decoder.new_cache(),
            &mut StdRng::seed_from_u64(0),
            &CancellationToken::never(),
            |t| streamed.push(t),
        )
        .unwrap();
    assert_eq!(streamed.len(), 6);
    assert_eq!(streamed[2], StreamedImageToken { step: 2, token: 3 });
    assert_eq!(tokens, streamed.iter().map(|t| t.token).collect::<Vec<_>>());

    let err = decoder
        .generate_in(
            &text_tokens,
            &encoder_state,
            &mut decoder.new_cache(),
            &mut StdRng::seed_from_u64(0),
            &CancellationToken::already_cancelled(),
            |_| {},
        )
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::Cancelled { completed: 0, total: 6 }));

    let (token, handle) = CancellationToken::new();
    let err = decoder
        .generate_in(
            &text_tokens,
            &encoder_state,
            &mut decoder.new_cache(),
            &mut StdRng::seed_from_u64(0),
            &token,
            |t| {
                if t.step == 1 {
                    handle.cancel();
                }
            },
        )
        .err()
        .unwrap();
    assert!(matches!(err, DalleError::Cancelled { completed: 2, total: 6 }));
}

#[test]
fn test_generate_in_resets_a_used_cache() {
    let config = small_config(16, 4, 4).with_verbose(true);
    let decoder = rigged_decoder(config, 9);
    let (text_tokens, encoder_state) = prompt(16);
    let mut cache = decoder.new_cache();
    let mut rng = StdRng::seed_from_u64(0);

    for _ in 0..2 {
        let tokens = decoder
            .generate_in(
                &text_tokens,
                &encoder_state,
                &mut cache,
                &mut rng,
                &CancellationToken::never(),
                |_| {},
            )
            .unwrap();
        assert_eq!(tokens, vec![9; 4]);
        assert_eq!(cache.get_seq_length(), 4);
    }
}

#[test]
fn test_tiny_preset_smoke_run() {
    let config = DalleBartDecoderConfig::tiny().with_sample_token_count(3);
    let mut rng = StdRng::seed_from_u64(21);
    let decoder = DalleBartDecoder::random(config, &mut rng).unwrap();
    let text_tokens = synthetic_text_tokens(&mut rng, 16, 5, 1).unwrap();
    let encoder_state = synthetic_encoder_state(&mut rng, 16, 64).unwrap();

    let tokens = decoder.generate(&text_tokens, &encoder_state, &mut rng).unwrap();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|&t| t <= 16384));
}

#[test]
fn test_synthetic_text_tokens_layout() {
    let mut rng = StdRng::seed_from_u64(22);
    let tokens = synthetic_text_tokens(&mut rng, 8, 3, 1).unwrap();

    assert_eq!(tokens.dim(), (2, 8));
    assert_eq!(tokens[[0, 0]], 0);
    assert_eq!(tokens[[0, 4]], 2);
    assert!((1..4).all(|j| tokens[[0, j]] >= 3));
    assert_eq!(tokens.slice(s![0, 5..]).to_vec(), vec![1, 1, 1]);
    assert_eq!(tokens.row(1).to_vec(), vec![0, 2, 1, 1, 1, 1, 1, 1]);

    assert!(synthetic_text_tokens(&mut rng, 4, 3, 1).is_err());
}

#[test]
fn test_decoder_owns_its_config() {
    let config = small_config(16, 4, 3).with_condition_factor(2.5);
    let decoder = random_decoder(config.clone(), 1);
    assert_eq!(decoder.config(), &config);

    let cache = decoder.new_cache();
    assert_eq!(cache.num_layers(), config.layer_count);
    assert_eq!(cache.max_len(), config.image_token_count);
    assert!(decoder.check_cache(&cache).is_ok());
}
