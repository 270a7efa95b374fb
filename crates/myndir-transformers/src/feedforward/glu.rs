//! Gated linear unit feed-forward with internal normalization.
//!
//! `fc2(ln1(gelu(fc0(ln0(x))) ⊙ fc1(ln0(x))))`, all projections bias-free.

use crate::activations::{Activation, apply_activation_2d};
use crate::linear_layer::LinearLayer;
use crate::normalization::LayerNorm;
use anyhow::{Result, anyhow};
use ndarray::Array3;

pub struct GluFeedForward {
    pub ln0: LayerNorm,
    pub ln1: LayerNorm,
    pub fc0: LinearLayer,
    pub fc1: LinearLayer,
    pub fc2: LinearLayer,
    pub activation: Activation,
}

impl GluFeedForward {
    pub fn new(
        ln0: LayerNorm,
        ln1: LayerNorm,
        fc0: impl Into<LinearLayer>,
        fc1: impl Into<LinearLayer>,
        fc2: impl Into<LinearLayer>,
        activation: Activation,
    ) -> Result<Self> {
        let (fc0, fc1, fc2) = (fc0.into(), fc1.into(), fc2.into());
        let hidden = ln0.dim();
        let intermediate = fc0.out_features();

        ln1.expect_dim(intermediate, "glu.ln1")?;
        fc0.expect_shape(intermediate, hidden, "glu.fc0")?;
        fc1.expect_shape(intermediate, hidden, "glu.fc1")?;
        fc2.expect_shape(hidden, intermediate, "glu.fc2")?;

        Ok(Self {
            ln0,
            ln1,
            fc0,
            fc1,
            fc2,
            activation,
        })
    }

    pub fn intermediate_size(&self) -> usize {
        self.fc0.out_features()
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, hidden_dim) = hidden.dim();
        if hidden_dim != self.ln0.dim() {
            return Err(anyhow!(
                "glu input width {} doesn't match {}",
                hidden_dim,
                self.ln0.dim()
            ));
        }

        let normed = self.ln0.forward_3d(hidden);
        let normed_2d = normed.view().into_shape_with_order((batch * seq, hidden_dim))?;

        // Gate and value projections run simultaneously.
        let (mut gate, value) = rayon::join(
            || self.fc0.matmul(&normed_2d),
            || self.fc1.matmul(&normed_2d),
        );

        apply_activation_2d(&mut gate, self.activation);
        let gated = self.ln1.forward_2d(&(gate * value));

        let output_2d = self.fc2.matmul(&gated.view());

        Ok(output_2d.into_shape_with_order((batch, seq, self.fc2.out_features()))?)
    }
}
