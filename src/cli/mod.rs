//! CLI command implementations

pub mod download;
pub mod error;
pub mod validate;

use clap::{Parser, Subcommand};
use std::str::FromStr;

pub use download::DownloadArgs;
pub use error::CliError;
pub use validate::ValidateArgs;

/// Healthcare dataset downloader CLI
#[derive(Parser, Debug)]
#[command(name = "healthcare-data-downloader")]
#[command(about = "Download CMS healthcare datasets to CSV with resumable pagination", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download every dataset of a work list (or a single dataset)
    Download(DownloadArgs),

    /// Check a work list without downloading
    Validate(ValidateArgs),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}
