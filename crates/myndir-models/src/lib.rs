//! Image-token decoder models built on myndir-transformers.
//!
//! The crate wires the generic building blocks into the DALL·E-BART decoder:
//! given a prompt's encoder output it generates a fixed-length sequence of image
//! tokens, one step at a time, over a fixed-capacity key/value cache.
//!
//! # Example
//!
//! ```no_run
//! use myndir_models::{DalleBartDecoder, DalleBartDecoderConfig};
//! use myndir_models::models::dalle_bart::{synthetic_encoder_state, synthetic_text_tokens};
//! use rand::SeedableRng;
//!
//! # fn main() -> myndir_models::DalleResult<()> {
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let config = DalleBartDecoderConfig::tiny().with_sample_token_count(8);
//! let decoder = DalleBartDecoder::random(config, &mut rng)?;
//!
//! let text_tokens = synthetic_text_tokens(&mut rng, 64, 5, 1)?;
//! let encoder_state = synthetic_encoder_state(&mut rng, 64, 64)?;
//! let image_tokens = decoder.generate(&text_tokens, &encoder_state, &mut rng)?;
//! assert_eq!(image_tokens.len(), 8);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;

pub use error::{DalleError, DalleResult};
pub use models::dalle_bart::{
    DalleBartDecoder, DalleBartDecoderConfig, DalleBartDecoderWeights, StreamedImageToken,
};
