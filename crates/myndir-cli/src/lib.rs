use clap::{Args, Parser, Subcommand};

/// Log target of the per-token progress lines.
pub const PROGRESS_LOG_TARGET: &str = myndir_models::models::dalle_bart::PROGRESS_TARGET;

#[derive(Parser)]
#[command(name = "myndir")]
#[command(about = "Myndir: image-token sampling with a DALL-E BART decoder", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Sample image tokens from a decoder with synthetic weights
    Sample(SampleArgs),

    /// Print a preset decoder config as JSON
    Config {
        /// Preset name (mini, mega, tiny)
        #[arg(default_value = "mini")]
        preset: String,
    },
}

/// Options of `myndir sample`.
#[derive(Args, Debug, PartialEq)]
pub struct SampleArgs {
    /// Model preset (mini, mega, tiny)
    #[arg(short, long, default_value = "tiny")]
    pub preset: String,

    /// Load the decoder config from a JSON file instead of a preset
    #[arg(short, long)]
    pub config: Option<String>,

    /// Number of image tokens to sample (defaults to the config's sample_token_count)
    #[arg(short = 'n', long)]
    pub steps: Option<usize>,

    /// Encoder sequence length
    #[arg(long, default_value_t = 64)]
    pub prompt_len: usize,

    /// Number of synthetic prompt tokens between BOS and EOS
    #[arg(long, default_value_t = 8)]
    pub prompt_tokens: usize,

    /// Seed for weights, prompt and sampling
    #[arg(short, long, default_value_t = 0)]
    pub seed: u64,

    /// Guidance scale blending the conditional and unconditional logits
    #[arg(long)]
    pub condition_factor: Option<f32>,

    /// Log "image token {i} is {token}" after every step
    #[arg(long)]
    pub progress: bool,

    /// Print the tokens as a JSON array
    #[arg(long)]
    pub json: bool,

    /// Suppress status messages
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn verbosity_to_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Default `env_logger` filter: the verbosity level plus the progress target,
/// which only logs when a run asks for it.
pub fn default_log_filter(verbose: u8) -> String {
    format!("{},{}=info", verbosity_to_log_level(verbose), PROGRESS_LOG_TARGET)
}
