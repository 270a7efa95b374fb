use crate::attention::{MultiHeadAttention, masked_attention};
use crate::cache::CpuKVCache;
use crate::linear_layer::LinearLayer;
use anyhow::{Result, bail};
use ndarray::{Array2, Array3, Array4};

/// Causal self-attention over a position-indexed [`CpuKVCache`].
///
/// Each call handles exactly one new token per batch entry: its key/value pair is
/// written into slot `step`, then the query attends over the whole cache under a
/// mask that hides every slot after `step`.
pub struct DecoderSelfAttention {
    pub attn: MultiHeadAttention,
}

impl DecoderSelfAttention {
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
        cache: &mut CpuKVCache,
        layer_idx: usize,
        step: usize,
        causal_mask: &Array2<bool>,
    ) -> Result<Array3<f32>> {
        self.forward_with_probs(hidden_states, cache, layer_idx, step, causal_mask)
            .map(|(out, _)| out)
    }

    /// Like [`forward`](Self::forward), also returning the attention weights
    /// `[batch, heads, 1, max_len]`.
    pub fn forward_with_probs(
        &self,
        hidden_states: &Array3<f32>,
        cache: &mut CpuKVCache,
        layer_idx: usize,
        step: usize,
        causal_mask: &Array2<bool>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let (batch, seq_len, _) = hidden_states.dim();
        if seq_len != 1 {
            bail!("self-attention decodes one token per call, got {}", seq_len);
        }

        // 1. Project and store the new key/value pair
        let (new_k, new_v) = self.attn.project_kv(hidden_states)?;
        cache.update(layer_idx, step, &new_k, &new_v)?;

        // 2. Query over the full cache
        let q = self.attn.project_query(hidden_states)?;
        let (cache_k, cache_v) = match cache.get(layer_idx) {
            Some(kv) => kv,
            None => bail!("cache has no layer {}", layer_idx),
        };
        let max_len = cache_k.shape()[1];
        let shape = (batch, max_len, self.attn.num_heads, self.attn.head_dim);
        let k_heads = cache_k.into_shape_with_order(shape)?;
        let v_heads = cache_v.into_shape_with_order(shape)?;

        let out = masked_attention(&q.view(), &k_heads, &v_heads, causal_mask)?;
        let output = self.attn.merge_heads(out.context)?;

        Ok((output, out.probs))
    }
}
