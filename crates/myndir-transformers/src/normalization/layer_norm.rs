//! Layer normalization implementation

use anyhow::{Result, anyhow};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};

/// Layer normalization over the last (embedding) axis.
///
/// Statistics are computed per token and per batch entry; nothing is shared
/// across rows.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// The torch initialization: weight 1, bias 0.
    pub fn identity(dim: usize, eps: f32) -> Self {
        Self::new(Array1::ones(dim), Array1::zeros(dim), eps)
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    pub fn expect_dim(&self, dim: usize, name: &str) -> Result<()> {
        if self.weight.len() != dim || self.bias.len() != dim {
            return Err(anyhow!(
                "{} has weight/bias lengths {}/{}, expected {}",
                name,
                self.weight.len(),
                self.bias.len(),
                dim
            ));
        }
        Ok(())
    }

    /// Apply layer norm to a 3D tensor of activations `[batch, seq, hidden]`.
    #[inline]
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let hidden = hidden_states.shape()[2].max(1) as f32;
        let mean = hidden_states.sum_axis(Axis(2)) / hidden;
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let var_expanded = variance.insert_axis(Axis(2));

        let inv_std = (&var_expanded + self.eps).mapv(|x| 1.0 / x.sqrt());
        let normalized_hidden = (hidden_states - &mean_expanded) * &inv_std;

        normalized_hidden * &self.weight + &self.bias
    }

    /// Apply layer norm to a 3D tensor
    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        self.forward(&hidden.view())
    }

    /// Apply layer norm to a `[rows, hidden]` matrix.
    pub fn forward_2d(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let view = hidden.view().insert_axis(Axis(0));
        self.forward(&view).remove_axis(Axis(0))
    }
}
