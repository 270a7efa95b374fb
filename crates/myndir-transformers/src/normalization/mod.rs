pub mod layer_norm;

pub use crate::normalization::layer_norm::LayerNorm;
