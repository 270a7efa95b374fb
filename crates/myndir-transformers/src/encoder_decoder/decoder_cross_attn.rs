use crate::attention::{MultiHeadAttention, masked_attention};
use crate::linear_layer::LinearLayer;
use anyhow::Result;
use ndarray::{Array2, Array3, Array4};

/// Attention from the decoder state to the encoder memory.
///
/// Keys and values are projected from the encoder memory on every call.
pub struct DecoderCrossAttention {
    pub attn: MultiHeadAttention,
}

impl DecoderCrossAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        q: LinearLayer,
        k: LinearLayer,
        v: LinearLayer,
        o: LinearLayer,
    ) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(hidden_size, num_heads, q, k, v, o)?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        encoder_hidden_states: &Array3<f32>,
        padding_mask: &Array2<bool>,
    ) -> Result<Array3<f32>> {
        self.forward_with_probs(hidden_states, encoder_hidden_states, padding_mask)
            .map(|(out, _)| out)
    }

    /// Returns the output and the attention weights `[batch, heads, q_len, enc_len]`.
    pub fn forward_with_probs(
        &self,
        hidden_states: &Array3<f32>,
        encoder_hidden_states: &Array3<f32>,
        padding_mask: &Array2<bool>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let (batch, enc_len, _) = encoder_hidden_states.dim();

        let (k, v) = self.attn.project_kv(encoder_hidden_states)?;
        let shape = (batch, enc_len, self.attn.num_heads, self.attn.head_dim);
        let k_heads = k.into_shape_with_order(shape)?;
        let v_heads = v.into_shape_with_order(shape)?;

        let q = self.attn.project_query(hidden_states)?;

        let out = masked_attention(&q.view(), &k_heads.view(), &v_heads.view(), padding_mask)?;
        let output = self.attn.merge_heads(out.context)?;

        Ok((output, out.probs))
    }
}
