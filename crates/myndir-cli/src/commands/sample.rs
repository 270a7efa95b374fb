use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::{self, Write};
use std::time::Instant;

use myndir_cli::SampleArgs;
use myndir_models::models::dalle_bart::{synthetic_encoder_state, synthetic_text_tokens};
use myndir_models::{DalleBartDecoder, DalleBartDecoderConfig};
use myndir_transformers::CancellationToken;

pub fn run(args: &SampleArgs) -> Result<()> {
    // 1. Resolve config
    let mut config = match args.config.as_deref() {
        Some(path) => DalleBartDecoderConfig::from_file(path)
            .with_context(|| format!("failed to load decoder config from '{}'", path))?,
        None => DalleBartDecoderConfig::from_preset(&args.preset)?,
    };
    if let Some(steps) = args.steps {
        config = config.with_sample_token_count(steps);
    }
    if let Some(factor) = args.condition_factor {
        config = config.with_condition_factor(factor);
    }
    config = config.with_verbose(args.progress);
    config.validate()?;

    // 2. Build the decoder and its synthetic inputs
    if !args.quiet {
        eprintln!(
            "Building decoder ({} layers, embed {}, {} heads, vocab {})...",
            config.layer_count,
            config.embed_count,
            config.attention_head_count,
            config.image_vocab_size
        );
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let t_build = Instant::now();
    let decoder = DalleBartDecoder::random(config, &mut rng)?;
    log::info!("Decoder built in {:.2?}", t_build.elapsed());

    let pad_token = decoder.config().pad_token;
    let embed_count = decoder.config().embed_count;
    let text_tokens = synthetic_text_tokens(&mut rng, args.prompt_len, args.prompt_tokens, pad_token)?;
    let encoder_state = synthetic_encoder_state(&mut rng, args.prompt_len, embed_count)?;

    // 3. Generate
    let total = decoder.config().sample_token_count;
    if !args.quiet {
        eprintln!("Sampling {} image tokens...", total);
    }

    let mut cache = decoder.new_cache();
    let t_start = Instant::now();
    let tokens = decoder.generate_in(
        &text_tokens,
        &encoder_state,
        &mut cache,
        &mut rng,
        &CancellationToken::never(),
        |token| log::debug!("step {}/{}: {}", token.step + 1, total, token.token),
    )?;
    let elapsed = t_start.elapsed();

    // 4. Print
    let mut stdout = io::stdout();
    if args.json {
        writeln!(stdout, "{}", serde_json::to_string(&tokens)?)?;
    } else {
        let line = tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(stdout, "{}", line)?;
    }
    stdout.flush()?;

    if !args.quiet {
        eprintln!(
            "Sampled {} image tokens in {:.2?} ({:.2} tokens/s)",
            tokens.len(),
            elapsed,
            tokens.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }

    Ok(())
}
