//! Multi-head scaled dot-product attention with boolean masking.
//!
//! Tensors use the `[batch, seq, heads, head_dim]` layout. The primitive does not
//! scale: callers pre-scale queries by `1 / sqrt(head_dim)`.

use crate::activations::softmax_row;
use crate::linear_layer::LinearLayer;
use crate::utils::masks::apply_attention_mask;
use anyhow::{Result, anyhow, bail};
use ndarray::{Array2, Array3, Array4, ArrayView4, Axis, Zip, s};
use rayon::prelude::*;


/// Output of [`masked_attention`].
pub struct AttentionOutput {
    /// `[batch, q_len, heads, head_dim]`
    pub context: Array4<f32>,
    /// Post-softmax weights, `[batch, heads, q_len, k_len]`.
    pub probs: Array4<f32>,
}

/// Computes `softmax(mask(Q·Kᵀ))·V` per batch entry and head.
///
/// `mask` is `[batch, k_len]` and is broadcast over heads and queries. Masked
/// positions receive exactly zero weight.
pub fn masked_attention(
    queries: &ArrayView4<f32>,
    keys: &ArrayView4<f32>,
    values: &ArrayView4<f32>,
    mask: &Array2<bool>,
) -> Result<AttentionOutput> {
    let (batch, q_len, heads, head_dim) = queries.dim();
    let (k_batch, k_len, k_heads, k_dim) = keys.dim();

    if (k_batch, k_heads, k_dim) != (batch, heads, head_dim) {
        bail!(
            "key shape {:?} is incompatible with query shape {:?}",
            keys.shape(),
            queries.shape()
        );
    }
    if values.dim() != keys.dim() {
        bail!(
            "value shape {:?} doesn't match key shape {:?}",
            values.shape(),
            keys.shape()
        );
    }

    // Scores: [B, H, Q, K], one (batch, head) pair per parallel task.
    let mut scores = Array4::<f32>::zeros((batch, heads, q_len, k_len));
    scores
        .view_mut()
        .into_shape_with_order((batch * heads, q_len, k_len))?
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(pair, mut out)| {
            let (b, h) = (pair / heads, pair % heads);
            let q = queries.slice(s![b, .., h, ..]);
            let k = keys.slice(s![b, .., h, ..]);
            out.assign(&q.dot(&k.t()));
        });

    apply_attention_mask(&mut scores, mask)?;

    Zip::from(scores.lanes_mut(Axis(3))).par_for_each(|mut row| softmax_row(&mut row));

    // Context: [B, H, Q, D]
    let mut context = Array4::<f32>::zeros((batch, heads, q_len, head_dim));
    context
        .view_mut()
        .into_shape_with_order((batch * heads, q_len, head_dim))?
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(pair, mut out)| {
            let (b, h) = (pair / heads, pair % heads);
            let p = scores.slice(s![b, h, .., ..]);
            let v = values.slice(s![b, .., h, ..]);
            out.assign(&p.dot(&v));
        });

    let context = context
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .to_owned();

    Ok(AttentionOutput {
        context,
        probs: scores,
    })
}

/// Bias-free query/key/value/output projections shared by the decoder
/// self- and cross-attention blocks.
pub struct MultiHeadAttention {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub o_proj: LinearLayer,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scale_factor: f32,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        q: LinearLayer,
        k: LinearLayer,
        v: LinearLayer,
        o: LinearLayer,
    ) -> Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            bail!(
                "hidden size {} is not divisible by head count {}",
                hidden_size,
                num_heads
            );
        }
        q.expect_shape(hidden_size, hidden_size, "q_proj")?;
        k.expect_shape(hidden_size, hidden_size, "k_proj")?;
        v.expect_shape(hidden_size, hidden_size, "v_proj")?;
        o.expect_shape(hidden_size, hidden_size, "out_proj")?;

        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: q,
            k_proj: k,
            v_proj: v,
            o_proj: o,
            num_heads,
            head_dim,
            scale_factor: 1.0 / (head_dim as f32).sqrt(),
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    fn flatten<'a>(&self, states: &'a Array3<f32>) -> Result<ndarray::ArrayView2<'a, f32>> {
        let (batch, seq_len, hidden) = states.dim();
        if hidden != self.hidden_size() {
            return Err(anyhow!(
                "hidden width {} doesn't match attention width {}",
                hidden,
                self.hidden_size()
            ));
        }
        Ok(states
            .view()
            .into_shape_with_order((batch * seq_len, hidden))?)
    }

    /// Projects `[B, S, E]` into queries already scaled by `1/sqrt(head_dim)`,
    /// laid out as `[B, S, H, D]`.
    pub fn project_query(&self, hidden_states: &Array3<f32>) -> Result<Array4<f32>> {
        let (batch, seq_len, _) = hidden_states.dim();
        let mut q = self.q_proj.matmul(&self.flatten(hidden_states)?);
        q.mapv_inplace(|x| x * self.scale_factor);
        self.split_heads(q, batch, seq_len)
    }

    /// Projects `[B, S, E]` into keys and values, kept flat as `[B, S, E]`.
    pub fn project_kv(&self, source: &Array3<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        let (batch, seq_len, _) = source.dim();
        let flat = self.flatten(source)?;
        let (k, v) = rayon::join(|| self.k_proj.matmul(&flat), || self.v_proj.matmul(&flat));
        let hidden = self.hidden_size();
        Ok((
            k.into_shape_with_order((batch, seq_len, hidden))?,
            v.into_shape_with_order((batch, seq_len, hidden))?,
        ))
    }

    pub fn split_heads(&self, x: Array2<f32>, batch: usize, seq_len: usize) -> Result<Array4<f32>> {
        Ok(x.into_shape_with_order((batch, seq_len, self.num_heads, self.head_dim))?)
    }

    /// Concatenates heads of a `[B, S, H, D]` context and applies the output projection.
    pub fn merge_heads(&self, context: Array4<f32>) -> Result<Array3<f32>> {
        let (batch, seq_len, _, _) = context.dim();
        let hidden = self.hidden_size();
        let flat = context.into_shape_with_order((batch * seq_len, hidden))?;
        let output = self.o_proj.matmul(&flat.view());
        Ok(output.into_shape_with_order((batch, seq_len, hidden))?)
    }
}
