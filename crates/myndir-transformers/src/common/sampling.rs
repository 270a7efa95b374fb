//! Guidance blending and truncated categorical sampling.

use anyhow::{Result, anyhow, bail};
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

/// Number of highest-scoring candidates kept before sampling.
pub const TOP_K_CANDIDATES: usize = 50;

/// Classifier-free guidance: `a * cond + (1 - a) * uncond`.
pub fn blend_logits(cond: &ArrayView1<f32>, uncond: &ArrayView1<f32>, a: f32) -> Result<Array1<f32>> {
    if cond.len() != uncond.len() {
        bail!(
            "cannot blend logits of lengths {} and {}",
            cond.len(),
            uncond.len()
        );
    }
    Ok(cond.mapv(|c| a * c) + &uncond.mapv(|u| (1.0 - a) * u))
}

/// Returns the `k`-th largest value (1-based) under a total order.
pub fn kth_largest(logits: &ArrayView1<f32>, k: usize) -> Option<f32> {
    if k == 0 || k > logits.len() {
        return None;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    Some(sorted[k - 1])
}

/// Unnormalized top-k weights.
///
/// Every entry at or above the `k`-th largest logit gets `exp(logit - max)`, the
/// rest get `0`. Ties at the cutoff are all kept. `k` larger than the vocabulary
/// keeps everything.
pub fn top_k_weights(logits: &ArrayView1<f32>, k: usize) -> Result<Array1<f32>> {
    if logits.is_empty() {
        bail!("cannot take top-{} of empty logits", k);
    }
    let k = k.clamp(1, logits.len());
    let cutoff = kth_largest(logits, k).ok_or_else(|| anyhow!("top-{} cutoff undefined", k))?;
    let max = logits.fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    Ok(logits.mapv(|l| if l >= cutoff { (l - max).exp() } else { 0.0 }))
}

/// Draws an index with probability proportional to `weights`.
///
/// Fails when every weight is zero or any weight is negative or not finite.
pub fn sample_from_weights<R: Rng + ?Sized>(weights: &ArrayView1<f32>, rng: &mut R) -> Result<u32> {
    let dist = WeightedIndex::new(weights.iter().copied())
        .map_err(|e| anyhow!("degenerate sampling distribution: {}", e))?;
    Ok(dist.sample(rng) as u32)
}
