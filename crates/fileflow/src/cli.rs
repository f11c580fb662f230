//! Command-line surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fileflow", version, about = "Structured file ingestion into relational targets")]
pub struct Cli {
    /// Mirror the full log filter to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process matching files from the drop directory.
    ///
    /// Exit code 0 unless an internal error occurred; per-file failures
    /// are reported, quarantined, and do not fail the process. Exit
    /// code 2 is reserved for configuration errors.
    Run {
        /// Process a single file, regardless of the drop directory.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Override the configured drop directory.
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Restrict matching to one source by name.
        #[arg(long)]
        source: Option<String>,
    },
    /// Print the validated source registry.
    Sources,
}
