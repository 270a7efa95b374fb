use crate::cache::CpuKVCache;
use crate::encoder_decoder::{DecoderCrossAttention, DecoderSelfAttention};
use crate::feedforward::GluFeedForward;
use crate::normalization::LayerNorm;
use anyhow::Result;
use ndarray::{Array2, Array3, Array4};
use std::time::Instant;

/// Attention weights captured during one layer step.
pub struct LayerAttentionProbs {
    /// `[batch, heads, 1, max_len]`
    pub self_attn: Array4<f32>,
    /// `[batch, heads, 1, enc_len]`
    pub cross_attn: Array4<f32>,
}

/// A decoder layer with sandwich normalization.
///
/// Both attention sublayers normalize their input and their output before the
/// residual add. The GLU carries its own norms.
pub struct DecoderCrossAttentionLayer {
    pub pre_self_attn_layer_norm: LayerNorm,
    pub self_attn: DecoderSelfAttention,
    pub self_attn_layer_norm: LayerNorm,

    pub pre_cross_attn_layer_norm: LayerNorm,
    pub cross_attn: DecoderCrossAttention,
    pub cross_attn_layer_norm: LayerNorm,

    pub glu: GluFeedForward,
}

impl DecoderCrossAttentionLayer {
    pub fn hidden_size(&self) -> usize {
        self.self_attn.attn.hidden_size()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        encoder_hidden_states: &Array3<f32>,
        self_mask: &Array2<bool>,
        cross_mask: &Array2<bool>,
        cache: &mut CpuKVCache,
        layer_idx: usize,
        step: usize,
    ) -> Result<Array3<f32>> {
        self.forward_with_probs(
            hidden_states,
            encoder_hidden_states,
            self_mask,
            cross_mask,
            cache,
            layer_idx,
            step,
        )
        .map(|(out, _)| out)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward_with_probs(
        &self,
        hidden_states: &Array3<f32>,
        encoder_hidden_states: &Array3<f32>,
        self_mask: &Array2<bool>,
        cross_mask: &Array2<bool>,
        cache: &mut CpuKVCache,
        layer_idx: usize,
        step: usize,
    ) -> Result<(Array3<f32>, LayerAttentionProbs)> {
        // 1. Self Attention
        let t_sa = Instant::now();
        let normed = self.pre_self_attn_layer_norm.forward_3d(hidden_states);
        let (attn_out, self_probs) =
            self.self_attn
                .forward_with_probs(&normed, cache, layer_idx, step, self_mask)?;
        let hidden_states = hidden_states + &self.self_attn_layer_norm.forward_3d(&attn_out);
        log::debug!("[layer {}] self-attention took {:?}", layer_idx, t_sa.elapsed());

        // 2. Cross Attention
        let t_ca = Instant::now();
        let normed = self.pre_cross_attn_layer_norm.forward_3d(&hidden_states);
        let (cross_out, cross_probs) =
            self.cross_attn
                .forward_with_probs(&normed, encoder_hidden_states, cross_mask)?;
        let hidden_states = hidden_states + &self.cross_attn_layer_norm.forward_3d(&cross_out);
        log::debug!("[layer {}] cross-attention took {:?}", layer_idx, t_ca.elapsed());

        // 3. GLU
        let t_ffn = Instant::now();
        let glu_out = self.glu.forward(&hidden_states)?;
        let hidden_states = hidden_states + &glu_out;
        log::debug!("[layer {}] glu took {:?}", layer_idx, t_ffn.elapsed());

        Ok((
            hidden_states,
            LayerAttentionProbs {
                self_attn: self_probs,
                cross_attn: cross_probs,
            },
        ))
    }
}
