//! The DALL·E-BART image-token decoder: a BART-style decoder stack with
//! sandwich-normalized layers, run as a two-branch batch and sampled with
//! classifier-free guidance.

pub mod config;
pub mod decoder;
pub mod generator;
pub mod init;

pub use config::DalleBartDecoderConfig;
pub use decoder::{BRANCH_COUNT, DalleBartDecoder, DalleBartDecoderWeights, DecodeTrace};
pub use generator::{PROGRESS_TARGET, StreamedImageToken};
pub use init::{synthetic_encoder_state, synthetic_text_tokens};

#[cfg(test)]
mod tests;
