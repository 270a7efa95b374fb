//! CPU Key-Value cache for autoregressive decoder models.
//!
//! Every layer owns a fixed-capacity `[batch, max_len, hidden]` key tensor and a
//! matching value tensor, zero-initialized. Slots are addressed by position and
//! written exactly once, in order.

use ndarray::{Array3, ArrayView3, s};

#[derive(Clone, Debug)]
pub struct CpuKVCache {
    layers: Vec<(Array3<f32>, Array3<f32>)>,
    written: Vec<usize>,
}

impl CpuKVCache {
    pub fn new(num_layers: usize, batch_size: usize, max_len: usize, hidden_size: usize) -> Self {
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            let k_cache = Array3::zeros((batch_size, max_len, hidden_size));
            let v_cache = Array3::zeros((batch_size, max_len, hidden_size));
            layers.push((k_cache, v_cache));
        }

        Self {
            layers,
            written: vec![0; num_layers],
        }
    }

    pub fn max_len(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[1]).unwrap_or(0)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_size(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[0]).unwrap_or(0)
    }

    pub fn hidden_size(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[2]).unwrap_or(0)
    }

    pub fn layers(&self) -> &[(Array3<f32>, Array3<f32>)] {
        &self.layers
    }

    /// Number of positions written into `layer_idx` so far.
    pub fn written(&self, layer_idx: usize) -> usize {
        self.written.get(layer_idx).copied().unwrap_or(0)
    }

    /// Number of positions written into every layer.
    pub fn get_seq_length(&self) -> usize {
        self.written.iter().copied().min().unwrap_or(0)
    }

    /// Writes `new_k`/`new_v` (`[batch, n, hidden]`) into slots
    /// `position..position + n` of one layer.
    ///
    /// `position` must be the next unwritten slot of that layer, so a slot can
    /// never be overwritten.
    pub fn update(
        &mut self,
        layer_idx: usize,
        position: usize,
        new_k: &Array3<f32>,
        new_v: &Array3<f32>,
    ) -> anyhow::Result<()> {
        if layer_idx >= self.layers.len() {
            anyhow::bail!(
                "layer index {} out of bounds (num_layers={})",
                layer_idx,
                self.layers.len()
            );
        }

        let expected = (self.batch_size(), new_k.shape()[1], self.hidden_size());
        if new_k.dim() != expected || new_v.dim() != expected {
            anyhow::bail!(
                "cache update shapes k={:?} v={:?}, expected {:?}",
                new_k.shape(),
                new_v.shape(),
                expected
            );
        }

        let written = self.written[layer_idx];
        if position != written {
            anyhow::bail!(
                "out-of-order cache write at position {} for layer {} (next slot is {})",
                position,
                layer_idx,
                written
            );
        }

        let new_tokens_len = new_k.shape()[1];
        let end_pos = position + new_tokens_len;

        if end_pos > self.max_len() {
            anyhow::bail!(
                "cache overflow: position={}, new_tokens={}, max_len={}",
                position,
                new_tokens_len,
                self.max_len()
            );
        }

        let target_slice = s![.., position..end_pos, ..];

        let (cache_k, cache_v) = &mut self.layers[layer_idx];
        cache_k.slice_mut(target_slice).assign(new_k);
        cache_v.slice_mut(target_slice).assign(new_v);
        self.written[layer_idx] = end_pos;

        Ok(())
    }

    /// Full-capacity views of one layer, including unwritten zero slots.
    pub fn get(&self, layer_idx: usize) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        self.layers.get(layer_idx).map(|(k, v)| (k.view(), v.view()))
    }

    /// Views of only the written slots of one layer.
    pub fn get_written(
        &self,
        layer_idx: usize,
    ) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        let (cache_k, cache_v) = self.layers.get(layer_idx)?;
        let active_slice = s![.., 0..self.written[layer_idx], ..];
        Some((cache_k.slice(active_slice), cache_v.slice(active_slice)))
    }

    /// Zeroes every slot and resets the write counters.
    pub fn clear(&mut self) {
        for (k, v) in self.layers.iter_mut() {
            k.fill(0.0);
            v.fill(0.0);
        }
        self.written.iter_mut().for_each(|w| *w = 0);
    }
}
