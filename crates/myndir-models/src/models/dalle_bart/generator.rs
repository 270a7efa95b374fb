//! Ancestral sampling loop over the decoder.

use std::time::Instant;

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use myndir_transformers::cache::CpuKVCache;
use myndir_transformers::common::CancellationToken;
use myndir_transformers::common::sampling::sample_from_weights;

use crate::error::{DalleError, DalleResult};
use crate::models::dalle_bart::decoder::DalleBartDecoder;

/// Log target of the per-step progress lines.
pub const PROGRESS_TARGET: &str = "myndir::progress";

/// Emitted once per generated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamedImageToken {
    pub step: usize,
    pub token: u32,
}

impl DalleBartDecoder {
    /// Generates `sample_token_count` image tokens with a fresh cache.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        rng: &mut R,
    ) -> DalleResult<Vec<u32>> {
        let mut cache = self.new_cache();
        self.generate_in(
            text_tokens,
            encoder_state,
            &mut cache,
            rng,
            &CancellationToken::never(),
            |_| {},
        )
    }

    /// [`generate`](Self::generate) with a `StdRng` seeded from `seed`.
    pub fn generate_seeded(
        &self,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        seed: u64,
    ) -> DalleResult<Vec<u32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.generate(text_tokens, encoder_state, &mut rng)
    }

    /// The full loop: resets `cache`, then decodes and samples one token per
    /// step, feeding each back as the next input.
    ///
    /// `cancel` is checked before every step. `on_token` sees every token as
    /// soon as it is sampled.
    pub fn generate_in<R, F>(
        &self,
        text_tokens: &Array2<u32>,
        encoder_state: &Array3<f32>,
        cache: &mut CpuKVCache,
        rng: &mut R,
        cancel: &CancellationToken,
        mut on_token: F,
    ) -> DalleResult<Vec<u32>>
    where
        R: Rng + ?Sized,
        F: FnMut(StreamedImageToken),
    {
        let config = self.config();
        let total = config.sample_token_count;

        self.check_cache(cache)?;
        cache.clear();

        let t_start = Instant::now();
        let mut image_tokens = Vec::with_capacity(total);
        let mut image_token = config.start_token();

        for step in 0..total {
            cancel.check().map_err(|_| DalleError::Cancelled {
                completed: step,
                total,
            })?;

            let weights = self.decode_step(image_token, step, text_tokens, encoder_state, cache)?;
            image_token = sample_from_weights(&weights.view(), rng)
                .map_err(|source| DalleError::DegenerateDistribution { step, source })?;

            if config.is_verbose {
                log::info!(target: PROGRESS_TARGET, "image token {} is {}", step, image_token);
            }
            on_token(StreamedImageToken {
                step,
                token: image_token,
            });
            image_tokens.push(image_token);
        }

        let elapsed = t_start.elapsed();
        log::info!(
            "Generated {} image tokens in {:.2?} ({:.2} tokens/s)",
            image_tokens.len(),
            elapsed,
            image_tokens.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );

        Ok(image_tokens)
    }
}
