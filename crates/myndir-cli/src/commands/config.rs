use anyhow::Result;

use myndir_models::DalleBartDecoderConfig;

pub fn run(preset: &str) -> Result<()> {
    let config = DalleBartDecoderConfig::from_preset(preset)?;
    println!("{}", config.to_json_pretty()?);
    Ok(())
}
