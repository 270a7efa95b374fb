//! Building blocks for incremental transformer decoding on the CPU.
//!
//! This crate provides the layers a cached, guided, autoregressive decoder is
//! assembled from, without any model-specific wiring.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod common;
pub mod embeddings;
pub mod encoder_decoder;
pub mod feedforward;
pub mod linear_layer;
pub mod normalization;
pub mod utils;

// Re-export commonly used items
pub use crate::{
    activations::Activation,
    attention::{AttentionOutput, MultiHeadAttention, masked_attention},
    cache::CpuKVCache,
    common::{CancellationHandle, CancellationToken, TOP_K_CANDIDATES},
    embeddings::Embeddings,
    encoder_decoder::{
        DecoderCrossAttention, DecoderCrossAttentionLayer, DecoderSelfAttention,
        LayerAttentionProbs,
    },
    feedforward::GluFeedForward,
    linear_layer::LinearLayer,
    normalization::LayerNorm,
};
