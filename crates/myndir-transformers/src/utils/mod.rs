pub mod masks;

pub use masks::{apply_attention_mask, causal_step_mask, padding_mask};
