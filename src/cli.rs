//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// latchkey — self-hosted federating identity broker
#[derive(Debug, Parser)]
#[command(name = "latchkey", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Subcommand; defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker (default)
    Serve,
}
