//! Synthetic parameters for smoke runs and tests.

use ndarray::{Array2, Array3};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::{Normal, Uniform};
use rand::Rng;

use myndir_transformers::encoder_decoder::{
    DecoderCrossAttention, DecoderCrossAttentionLayer, DecoderSelfAttention,
};
use myndir_transformers::feedforward::GluFeedForward;
use myndir_transformers::linear_layer::LinearLayer;
use myndir_transformers::normalization::LayerNorm;

use crate::error::{DalleError, DalleResult};
use crate::models::dalle_bart::config::DalleBartDecoderConfig;
use crate::models::dalle_bart::decoder::{BRANCH_COUNT, DalleBartDecoder, DalleBartDecoderWeights};

/// Bias-free `[out, in]` weights drawn from `U(-1/sqrt(in), 1/sqrt(in))`,
/// the torch `nn.Linear` default.
fn random_linear<R: Rng + ?Sized>(rng: &mut R, out_features: usize, in_features: usize) -> LinearLayer {
    let bound = 1.0 / (in_features.max(1) as f32).sqrt();
    LinearLayer::from(Array2::random_using(
        (out_features, in_features),
        Uniform::new_inclusive(-bound, bound),
        rng,
    ))
}

fn random_table<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize) -> DalleResult<Array2<f32>> {
    let normal = Normal::new(0.0f32, 1.0).map_err(|e| DalleError::InvalidConfig(e.to_string()))?;
    Ok(Array2::random_using((rows, cols), normal, rng))
}

fn random_layer<R: Rng + ?Sized>(
    rng: &mut R,
    config: &DalleBartDecoderConfig,
) -> anyhow::Result<DecoderCrossAttentionLayer> {
    let (embed, heads, glu) = (
        config.embed_count,
        config.attention_head_count,
        config.glu_embed_count,
    );
    let ln = |dim| LayerNorm::identity(dim, config.layer_norm_eps);

    let self_attn = DecoderSelfAttention::new(
        embed,
        heads,
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
    )?;
    let cross_attn = DecoderCrossAttention::new(
        embed,
        heads,
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
        random_linear(rng, embed, embed),
    )?;
    let glu = GluFeedForward::new(
        ln(embed),
        ln(glu),
        random_linear(rng, glu, embed),
        random_linear(rng, glu, embed),
        random_linear(rng, embed, glu),
        config.activation,
    )?;

    Ok(DecoderCrossAttentionLayer {
        pre_self_attn_layer_norm: ln(embed),
        self_attn,
        self_attn_layer_norm: ln(embed),
        pre_cross_attn_layer_norm: ln(embed),
        cross_attn,
        cross_attn_layer_norm: ln(embed),
        glu,
    })
}

impl DalleBartDecoderWeights {
    /// Randomly initialized parameters matching `config`.
    pub fn random<R: Rng + ?Sized>(config: &DalleBartDecoderConfig, rng: &mut R) -> DalleResult<Self> {
        config.validate()?;
        let (vocab, embed) = (config.decoder_vocab_size(), config.embed_count);

        let embed_tokens = random_table(rng, vocab, embed)?;
        let embed_positions = random_table(rng, config.image_token_count, embed)?;

        let mut layers = Vec::with_capacity(config.layer_count);
        for i in 0..config.layer_count {
            let layer = random_layer(&mut *rng, config)
                .map_err(|e| DalleError::InvalidConfig(format!("layer {}: {}", i, e)))?;
            layers.push(layer);
        }

        Ok(Self {
            embed_tokens,
            embed_positions,
            layernorm_embedding: LayerNorm::identity(embed, config.layer_norm_eps),
            layers,
            final_ln: LayerNorm::identity(embed, config.layer_norm_eps),
            lm_head: random_linear(rng, vocab, embed),
        })
    }
}

impl DalleBartDecoder {
    /// A decoder with random weights.
    pub fn random<R: Rng + ?Sized>(config: DalleBartDecoderConfig, rng: &mut R) -> DalleResult<Self> {
        let weights = DalleBartDecoderWeights::random(&config, rng)?;
        Self::new(config, weights)
    }
}

/// Prompt rows for a synthetic run: a conditional row of `token_count` ids
/// wrapped in BOS (0) and EOS (2), and an unconditional row holding just
/// BOS/EOS. Both are padded with `pad_token` to `prompt_len`.
pub fn synthetic_text_tokens<R: Rng + ?Sized>(
    rng: &mut R,
    prompt_len: usize,
    token_count: usize,
    pad_token: u32,
) -> DalleResult<Array2<u32>> {
    if token_count + 2 > prompt_len {
        return Err(DalleError::InvalidConfig(format!(
            "{} prompt tokens plus BOS/EOS don't fit in {} positions",
            token_count, prompt_len
        )));
    }

    let mut tokens = Array2::from_elem((BRANCH_COUNT, prompt_len), pad_token);
    tokens[[0, 0]] = 0;
    for i in 0..token_count {
        tokens[[0, i + 1]] = rng.gen_range(3..1000);
    }
    tokens[[0, token_count + 1]] = 2;
    tokens[[1, 0]] = 0;
    tokens[[1, 1]] = 2;
    Ok(tokens)
}

/// Standard-normal stand-in for encoder output, `[2, prompt_len, embed_count]`.
pub fn synthetic_encoder_state<R: Rng + ?Sized>(
    rng: &mut R,
    prompt_len: usize,
    embed_count: usize,
) -> DalleResult<Array3<f32>> {
    let normal = Normal::new(0.0f32, 1.0).map_err(|e| DalleError::InvalidConfig(e.to_string()))?;
    Ok(Array3::random_using((BRANCH_COUNT, prompt_len, embed_count), normal, rng))
}
