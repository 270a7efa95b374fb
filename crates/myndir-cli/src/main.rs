mod commands;

use anyhow::Result;
use clap::Parser;

use myndir_cli::{Cli, Commands, default_log_filter};

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_log_filter(cli.verbose)),
    )
    .init();

    match cli.command {
        Commands::Sample(args) => commands::sample::run(&args),

        Commands::Config { preset } => commands::config::run(&preset),
    }
}
