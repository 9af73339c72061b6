//! Validation subcommand

use super::{CliError, OutputFormat};
use crate::worklist::read_work_list;
use clap::Parser;
use std::path::PathBuf;

/// Check a work list for schema problems and unusable rows
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Work list CSV
    #[arg(long)]
    pub input: PathBuf,
}

impl ValidateArgs {
    /// Execute the validation command
    pub async fn execute(&self, format: OutputFormat) -> Result<(), CliError> {
        let list = read_work_list(&self.input)?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "input": self.input.display().to_string(),
                    "rows": list.total_rows,
                    "valid": list.items.len(),
                    "filtered_rows": list.filtered_rows,
                    "duplicates": list.duplicates,
                    "with_expected_rows": list.items.iter().filter(|i| i.expected_rows.is_some()).count(),
                });
                println!("{output}");
            }
            OutputFormat::Human => {
                println!("Work list: {}", self.input.display());
                println!("  Rows: {}", list.total_rows);
                println!("  Valid datasets: {}", list.items.len());
                if !list.filtered_rows.is_empty() {
                    println!(
                        "  Rows without identifier: {} (rows {})",
                        list.filtered_rows.len(),
                        list.filtered_rows
                            .iter()
                            .map(|r| r.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                if !list.duplicates.is_empty() {
                    println!("  Duplicate identifiers: {}", list.duplicates.join(", "));
                }
            }
        }

        if list.items.is_empty() {
            return Err(CliError::InvalidArgument(format!(
                "{} contains no downloadable datasets",
                self.input.display()
            )));
        }
        Ok(())
    }
}
