//! A CPU-based linear layer.
//!
//! Weight tensors are stored in the `[OutFeatures, InFeatures]` layout, the same
//! layout torch and safetensors use for `nn.Linear`. `matmul` multiplies by the
//! transposed view, so no copy is made at construction.

use anyhow::{Result, anyhow};
use ndarray::{Array1, Array2, ArrayView2};


/// A CPU-based linear transformation layer (y = xW^T + b).
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    /// Creates a new F32 `LinearLayer` from a `[OutFeatures, InFeatures]` weight
    /// matrix and an optional bias.
    pub fn new_f32(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    /// A zero-initialized, bias-free layer.
    pub fn zeros(out_features: usize, in_features: usize) -> Self {
        Self::new_f32(Array2::zeros((out_features, in_features)), None)
    }

    /// Computes `y = x @ W^T + b`.
    #[inline]
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = input.dot(&self.weight.t());

        if let Some(b) = &self.bias {
            result.outer_iter_mut().for_each(|mut row| row += b);
        }

        result
    }

    /// Checks that the layer maps `in_features` to `out_features`.
    pub fn expect_shape(&self, out_features: usize, in_features: usize, name: &str) -> Result<()> {
        if self.shape() != [out_features, in_features] {
            return Err(anyhow!(
                "{} has shape {:?}, expected [{}, {}]",
                name,
                self.shape(),
                out_features,
                in_features
            ));
        }
        if let Some(b) = &self.bias {
            if b.len() != out_features {
                return Err(anyhow!(
                    "{} bias has length {}, expected {}",
                    name,
                    b.len(),
                    out_features
                ));
            }
        }
        Ok(())
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.out_features(), self.in_features()]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weight: Array2<f32>) -> Self {
        LinearLayer::new_f32(weight, None)
    }
}
