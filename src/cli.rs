//! Command line interface for the seawire server binary.

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `seawire` binary.
#[derive(Debug, Parser)]
#[command(name = "seawire", version, about = "Seawire framework host process")]
pub struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Modules to load at startup.
    #[arg(short, long = "module")]
    pub modules: Vec<PathBuf>,
}
