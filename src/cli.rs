//! CLI definitions for fragtop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "fragtop",
    version,
    about = "Bounded IP fragment reassembly tables\n\nDrive sharded reassembly tables with synthetic fragment traffic (loss, duplicates, reordering) and report how the tables cope.",
    long_about = None
)]
pub struct Cli {
    /// Path to fragtop.toml config file
    #[clap(long, short, default_value = "fragtop.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a timed synthetic benchmark and output a structured report
    Bench {
        /// How many seconds to run the benchmark
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example fragtop.toml to stdout
    Init,
}
