//! DALL·E-BART image-token decoder stack.

use std::time::Instant;

use ndarray::{Array1, Array2, Array3, Axis};

use myndir_transformers::cache::CpuKVCache;
use myndir_transformers::common::sampling::{TOP_K_CANDIDATES, blend_logits, top_k_weights};
use myndir_transformers::encoder_decoder::{DecoderCrossAttentionLayer, LayerAttentionProbs};
use myndir_transformers::linear_layer::LinearLayer;
use myndir_transformers::normalization::LayerNorm;
use myndir_transformers::utils::masks::{causal_step_mask, padding_mask};
use myndir_transformers::Embeddings;

use crate::error::{DalleError, DalleResult};
use crate::models::dalle_bart::config::DalleBartDecoderConfig;

/// Conditional and unconditional rows.
pub const BRANCH_COUNT: usize = 2;

/// Learned parameters of the decoder, in the layout torch stores them.
pub struct DalleBartDecoderWeights {
    /// `[image_vocab_size + 1, embed_count]`
    pub embed_tokens: Array2<f32>,
    /// `[image_token_count, embed_count]`
    pub embed_positions: Array2<f32>,
    pub layernorm_embedding: LayerNorm,
    pub layers: Vec<DecoderCrossAttentionLayer>,
    pub final_ln: LayerNorm,
    /// `[image_vocab_size + 1, embed_count]`, no bias.
    pub lm_head: LinearLayer,
}

/// Everything one decode step computed, for inspection.
pub struct DecodeTrace {
    /// Raw `[2, image_vocab_size + 1]` logits, conditional row first.
    pub logits: Array2<f32>,
    /// Guidance-blended logits.
    pub blended: Array1<f32>,
    /// Per-layer attention weights.
    pub attention: Vec<LayerAttentionProbs>,
}

pub struct DalleBartDecoder {
    pub embeddings: Embeddings,
    pub layernorm_embedding: LayerNorm,
    pub layers: Vec<DecoderCrossAttentionLayer>,
    pub final_ln: LayerNorm,
    pub lm_head: LinearLayer,
    config: DalleBartDecoderConfig,
}

impl DalleBartDecoder {
    /// Assembles a decoder, refusing any parameter whose shape disagrees with
    /// `config`.
    pub fn new(config: DalleBartDecoderConfig, weights: DalleBartDecoderWeights) -> DalleResult<Self> {
        config.validate()?;
        let vocab = config.decoder_vocab_size();
        let embed = config.embed_count;

        expect_dims("embed_tokens", &[vocab, embed], weights.embed_tokens.shape())?;
        expect_dims(
            "embed_positions",
            &[config.image_token_count, embed],
            weights.embed_positions.shape(),
        )?;
        expect_norm("layernorm_embedding", &weights.layernorm_embedding, embed)?;
        expect_norm("final_ln", &weights.final_ln, embed)?;
        expect_dims("lm_head", &[vocab, embed], &weights.lm_head.shape())?;
        if weights.lm_head.has_bias() {
            return Err(DalleError::InvalidConfig("lm_head must be bias-free".to_string()));
        }

        if weights.layers.len() != config.layer_count {
            return Err(DalleError::shape(
                "layers",
                &[config.layer_count],
                &[weights.layers.len()],
            ));
        }
        for (i, layer) in weights.layers.iter().enumerate() {
            check_layer(i, layer, &config)?;
        }

        let embeddings = Embeddings::new(weights.embed_tokens, Some(weights.embed_positions))
            .map_err(|e| DalleError::InvalidConfig(e.to_string()))?;

        log::info!(
            "Built image-token decoder: {} layers, embed {}, {} heads, vocab {}",
            config.layer_count,
            embed,
            config.attention_head_count,
            vocab
        );

        Ok(Self {
            embeddings,
            layernorm_embedding: weights.layernorm_embedding,
            layers: weights.layers,
            final_ln: weights.final_ln,
            lm_head: weights.lm_head,
            config,
        })
    }

    pub fn config(&self) -> &DalleBartDecoderConfig {
        &self.config
    }

    /// A zeroed cache sized for this decoder: one slot per image position.
    pub fn new_cache(&self) -> CpuKVCache {
        CpuKVCache::new(
            self.config.layer_count,
            BRANCH_COUNT,
            self.config.image_token_count,
            self.config.embed_count,
        )
    }

    /// Truncated sampling weights for the token after `prev_token`.
    ///
    /// Entries outside the top [`TOP_K_CANDIDATES`] blended logits are zero.
    pub fn decode_step(
        &self,
        prev_token: u32,
        step: usize,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &mut CpuKVCache,
    ) -> DalleResult<Array1<f32>> {
        let blended = self.decode_logits(prev_token, step, text_tokens, encoder_state, cache)?;
        top_k_weights(&blended.view(), TOP_K_CANDIDATES).map_err(|source| DalleError::Step { step, source })
    }

    /// Guidance-blended logits for one step.
    pub fn decode_logits(
        &self,
        prev_token: u32,
        step: usize,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &mut CpuKVCache,
    ) -> DalleResult<Array1<f32>> {
        self.run_step(prev_token, step, text_tokens, encoder_state, cache, false)
            .map(|trace| trace.blended)
    }

    /// Like [`decode_logits`](Self::decode_logits), also keeping raw logits and
    /// every layer's attention weights.
    pub fn decode_traced(
        &self,
        prev_token: u32,
        step: usize,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &mut CpuKVCache,
    ) -> DalleResult<DecodeTrace> {
        self.run_step(prev_token, step, text_tokens, encoder_state, cache, true)
    }

    fn run_step(
        &self,
        prev_token: u32,
        step: usize,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &mut CpuKVCache,
        keep_attention: bool,
    ) -> DalleResult<DecodeTrace> {
        self.check_step_inputs(prev_token, step, text_tokens, encoder_state, cache)?;
        let wrap = |source: anyhow::Error| DalleError::Step { step, source };
        let t_step = Instant::now();

        // 1. Embed token + position, then normalize
        let token_ids = Array2::from_elem((BRANCH_COUNT, 1), prev_token);
        let embedded = self.embeddings.forward(&token_ids, step).map_err(wrap)?;
        let mut hidden = self.layernorm_embedding.forward_3d(&embedded);

        // 2. Layers
        let self_mask = causal_step_mask(BRANCH_COUNT, self.config.image_token_count, step);
        let cross_mask = padding_mask(text_tokens, self.config.pad_token);
        let mut attention = Vec::with_capacity(if keep_attention { self.layers.len() } else { 0 });

        for (i, layer) in self.layers.iter().enumerate() {
            let t_layer = Instant::now();
            let (next, probs) = layer
                .forward_with_probs(&hidden, encoder_state, &self_mask, &cross_mask, cache, i, step)
                .map_err(wrap)?;
            hidden = next;
            if keep_attention {
                attention.push(probs);
            }
            log::debug!("[step {}] layer {} took {:?}", step, i, t_layer.elapsed());
        }

        // 3. Final norm and head: [2, 1, E] -> [2, V + 1]
        let hidden = self.final_ln.forward_3d(&hidden).index_axis_move(Axis(1), 0);
        let logits = self.lm_head.matmul(&hidden.view());

        // 4. Guidance
        let blended = blend_logits(
            &logits.row(0),
            &logits.row(1),
            self.config.condition_factor,
        )
        .map_err(wrap)?;

        log::debug!("[step {}] decoded in {:?}", step, t_step.elapsed());

        Ok(DecodeTrace {
            logits,
            blended,
            attention,
        })
    }

    fn check_step_inputs(
        &self,
        prev_token: u32,
        step: usize,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &CpuKVCache,
    ) -> DalleResult<()> {
        let capacity = self.config.image_token_count;
        if step >= capacity {
            return Err(DalleError::StepOutOfRange { step, capacity });
        }

        let max = self.config.image_vocab_size as u32;
        if prev_token > max {
            return Err(DalleError::TokenOutOfRange {
                token: prev_token,
                max,
            });
        }

        for actual in [text_tokens.nrows(), encoder_state.shape()[0]] {
            if actual != BRANCH_COUNT {
                return Err(DalleError::BranchCount {
                    expected: BRANCH_COUNT,
                    actual,
                });
            }
        }

        let prompt_len = text_tokens.ncols();
        expect_dims(
            "encoder_state",
            &[BRANCH_COUNT, prompt_len, self.config.embed_count],
            encoder_state.shape(),
        )?;

        self.check_cache(cache)
    }

    /// Fails unless `cache` was sized for this decoder.
    pub fn check_cache(&self, cache: &CpuKVCache) -> DalleResult<()> {
        expect_dims(
            "kv cache",
            &[
                self.config.layer_count,
                BRANCH_COUNT,
                self.config.image_token_count,
                self.config.embed_count,
            ],
            &[
                cache.num_layers(),
                cache.batch_size(),
                cache.max_len(),
                cache.hidden_size(),
            ],
        )
    }
}

fn expect_dims(component: &str, expected: &[usize], actual: &[usize]) -> DalleResult<()> {
    if expected != actual {
        return Err(DalleError::shape(component, expected, actual));
    }
    Ok(())
}

fn expect_norm(component: &str, norm: &LayerNorm, dim: usize) -> DalleResult<()> {
    expect_dims(component, &[dim, dim], &[norm.weight.len(), norm.bias.len()])
}

fn check_layer(
    i: usize,
    layer: &DecoderCrossAttentionLayer,
    config: &DalleBartDecoderConfig,
) -> DalleResult<()> {
    let embed = config.embed_count;
    let heads = config.attention_head_count;
    let name = |part: &str| format!("layers.{}.{}", i, part);

    for (part, attn) in [
        ("self_attn", &layer.self_attn.attn),
        ("encoder_attn", &layer.cross_attn.attn),
    ] {
        expect_dims(
            &name(part),
            &[embed, heads],
            &[attn.hidden_size(), attn.num_heads],
        )?;
    }

    for (part, norm) in [
        ("pre_self_attn_layer_norm", &layer.pre_self_attn_layer_norm),
        ("self_attn_layer_norm", &layer.self_attn_layer_norm),
        ("pre_encoder_attn_layer_norm", &layer.pre_cross_attn_layer_norm),
        ("encoder_attn_layer_norm", &layer.cross_attn_layer_norm),
        ("glu.ln0", &layer.glu.ln0),
    ] {
        expect_norm(&name(part), norm, embed)?;
    }

    expect_dims(
        &name("glu.fc0"),
        &[config.glu_embed_count, embed],
        &layer.glu.fc0.shape(),
    )
}
