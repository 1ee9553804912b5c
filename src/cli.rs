use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keeps Minecraft account credentials signed in and fresh
#[derive(Parser, Debug)]
#[command(name = "pearlkeeper", version)]
pub struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show who an account is logged in as and whether its tokens are valid
    Check { label: String },
    /// Refresh whatever is stale for an account
    Refresh { label: String },
    /// Sign an account in with a one-time device code
    New { label: String },
    /// List accounts with stored credentials
    List,
}
