//! fragtop: bounded IP fragment reassembly tables.
//!
//! Runs sharded reassembly tables against synthetic fragment traffic and
//! reports table statistics. Run `fragtop --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod config;
mod traffic;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::FragtopConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Bench { duration, output } => {
            let config = if cli.config.exists() {
                config::FragtopConfig::load(&cli.config)?
            } else {
                eprintln!(
                    "No '{}' found, using built-in defaults. Run `fragtop init > {}` to customise.",
                    cli.config.display(),
                    cli.config.display()
                );
                config::FragtopConfig::default()
            };
            bench::run(&config, duration, output)?;
        }
    }

    Ok(())
}
