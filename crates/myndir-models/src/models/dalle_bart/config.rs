use std::path::Path;

use myndir_transformers::activations::Activation;
use serde::{Deserialize, Serialize};

use crate::error::{DalleError, DalleResult};

fn default_pad_token() -> u32 {
    1
}

fn default_condition_factor() -> f32 {
    10.0
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

/// Hyperparameters of the image-token decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DalleBartDecoderConfig {
    /// Number of image codes. Token `image_vocab_size` is the start/pad sentinel.
    pub image_vocab_size: usize,
    /// Positions (and cache slots) per image.
    pub image_token_count: usize,
    /// Tokens produced by one run.
    pub sample_token_count: usize,
    pub embed_count: usize,
    pub attention_head_count: usize,
    pub glu_embed_count: usize,
    pub layer_count: usize,

    /// First token fed to the decoder. Defaults to the sentinel.
    #[serde(default)]
    pub start_token: Option<u32>,
    /// Prompt token excluded from cross-attention.
    #[serde(default = "default_pad_token")]
    pub pad_token: u32,
    /// Guidance weight `a` in `a * cond + (1 - a) * uncond`.
    #[serde(default = "default_condition_factor", alias = "guidance_scale")]
    pub condition_factor: f32,
    #[serde(default = "default_layer_norm_eps", alias = "layer_norm_epsilon")]
    pub layer_norm_eps: f32,
    #[serde(default, alias = "activation_function")]
    pub activation: Activation,
    #[serde(default)]
    pub is_verbose: bool,
}

impl DalleBartDecoderConfig {
    /// The 12-layer "mini" model.
    pub fn mini() -> Self {
        Self::preset(12, 1024, 16, 2730)
    }

    /// The 24-layer "mega" model.
    pub fn mega() -> Self {
        Self::preset(24, 2048, 32, 4096)
    }

    /// A two-layer model small enough for tests and smoke runs.
    pub fn tiny() -> Self {
        Self::preset(2, 64, 4, 96)
    }

    fn preset(layer_count: usize, embed_count: usize, heads: usize, glu_embed_count: usize) -> Self {
        Self {
            image_vocab_size: 16384,
            image_token_count: 256,
            sample_token_count: 256,
            embed_count,
            attention_head_count: heads,
            glu_embed_count,
            layer_count,
            start_token: None,
            pad_token: default_pad_token(),
            condition_factor: default_condition_factor(),
            layer_norm_eps: default_layer_norm_eps(),
            activation: Activation::Gelu,
            is_verbose: false,
        }
    }

    /// Looks up a preset by name.
    pub fn from_preset(name: &str) -> DalleResult<Self> {
        match name.to_lowercase().as_str() {
            "mini" => Ok(Self::mini()),
            "mega" => Ok(Self::mega()),
            "tiny" => Ok(Self::tiny()),
            other => Err(DalleError::InvalidConfig(format!(
                "unknown preset '{}' (expected mini, mega or tiny)",
                other
            ))),
        }
    }

    pub fn from_json(json: &str) -> DalleResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> DalleResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json_pretty(&self) -> DalleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn start_token(&self) -> u32 {
        self.start_token.unwrap_or(self.image_vocab_size as u32)
    }

    /// Rows of the token table and width of the logits: codes plus the sentinel.
    pub fn decoder_vocab_size(&self) -> usize {
        self.image_vocab_size + 1
    }

    pub fn head_dim(&self) -> usize {
        self.embed_count / self.attention_head_count.max(1)
    }

    pub fn with_sample_token_count(mut self, sample_token_count: usize) -> Self {
        self.sample_token_count = sample_token_count;
        self
    }

    pub fn with_condition_factor(mut self, condition_factor: f32) -> Self {
        self.condition_factor = condition_factor;
        self
    }

    pub fn with_verbose(mut self, is_verbose: bool) -> Self {
        self.is_verbose = is_verbose;
        self
    }

    pub fn validate(&self) -> DalleResult<()> {
        let sizes = [
            ("image_vocab_size", self.image_vocab_size),
            ("image_token_count", self.image_token_count),
            ("sample_token_count", self.sample_token_count),
            ("embed_count", self.embed_count),
            ("attention_head_count", self.attention_head_count),
            ("glu_embed_count", self.glu_embed_count),
            ("layer_count", self.layer_count),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(DalleError::InvalidConfig(format!("{} must be non-zero", name)));
        }

        if self.embed_count % self.attention_head_count != 0 {
            return Err(DalleError::InvalidConfig(format!(
                "embed_count {} is not divisible by attention_head_count {}",
                self.embed_count, self.attention_head_count
            )));
        }
        if self.sample_token_count > self.image_token_count {
            return Err(DalleError::InvalidConfig(format!(
                "sample_token_count {} exceeds image_token_count {}",
                self.sample_token_count, self.image_token_count
            )));
        }

        let max_token = self.image_vocab_size as u32;
        if self.start_token() > max_token {
            return Err(DalleError::InvalidConfig(format!(
                "start_token {} exceeds the sentinel {}",
                self.start_token(),
                max_token
            )));
        }
        if self.pad_token > max_token {
            return Err(DalleError::InvalidConfig(format!(
                "pad_token {} exceeds the sentinel {}",
                self.pad_token, max_token
            )));
        }
        if !self.condition_factor.is_finite() {
            return Err(DalleError::InvalidConfig(format!(
                "condition_factor must be finite, got {}",
                self.condition_factor
            )));
        }
        if !(self.layer_norm_eps.is_finite() && self.layer_norm_eps > 0.0) {
            return Err(DalleError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }
}
