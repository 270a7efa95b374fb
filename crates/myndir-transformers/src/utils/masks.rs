//! Boolean attention masks.
//!
//! A mask is a `[batch, key_len]` array where `true` means the key position may be
//! attended to. Masks are broadcast across heads and queries when applied.

use anyhow::anyhow;
use ndarray::{Array2, Array4, Axis, Zip};

/// Score written into disallowed positions before the softmax.
pub const MASK_VALUE: f32 = f32::NEG_INFINITY;

/// Marks every prompt position whose token is not `pad_token`.
pub fn padding_mask(tokens: &Array2<u32>, pad_token: u32) -> Array2<bool> {
    tokens.mapv(|t| t != pad_token)
}

/// Mask for a single decode step over a fixed-capacity cache.
///
/// Position `j` is visible iff `j <= step`.
pub fn causal_step_mask(batch_size: usize, capacity: usize, step: usize) -> Array2<bool> {
    Array2::from_shape_fn((batch_size, capacity), |(_, j)| j <= step)
}

/// Sets `scores[b, h, q, k]` to [`MASK_VALUE`] wherever `mask[b, k]` is false.
pub fn apply_attention_mask(scores: &mut Array4<f32>, mask: &Array2<bool>) -> anyhow::Result<()> {
    let (batch_size, num_heads, seq_q, seq_k) = scores.dim();

    if mask.shape()[0] != batch_size {
        return Err(anyhow!(
            "mask batch size {} doesn't match scores batch size {}",
            mask.shape()[0],
            batch_size
        ));
    }

    if mask.shape()[1] != seq_k {
        return Err(anyhow!(
            "mask sequence length {} doesn't match key sequence length {}",
            mask.shape()[1],
            seq_k
        ));
    }

    // [batch, seq_k] -> [batch, 1, 1, seq_k]
    let mask_expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    let broadcast_mask = mask_expanded
        .broadcast((batch_size, num_heads, seq_q, seq_k))
        .ok_or_else(|| anyhow!("mask {:?} cannot broadcast to scores", mask.shape()))?;

    Zip::from(scores)
        .and(&broadcast_mask)
        .par_for_each(|s, &visible| {
            if !visible {
                *s = MASK_VALUE;
            }
        });

    Ok(())
}
