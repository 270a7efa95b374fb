//! Decoder-side blocks of an encoder-decoder transformer: cached causal
//! self-attention, cross-attention to the encoder memory, and the layer that
//! combines them with a gated feed-forward.

pub mod decoder_cross_attn;
pub mod decoder_cross_attn_layer;
pub mod decoder_self_attn;

pub use decoder_cross_attn::DecoderCrossAttention;
pub use decoder_cross_attn_layer::{DecoderCrossAttentionLayer, LayerAttentionProbs};
pub use decoder_self_attn::DecoderSelfAttention;
