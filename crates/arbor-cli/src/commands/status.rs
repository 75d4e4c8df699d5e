use arbor::MemoryEngine;
use clap::Parser;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_size, format_timestamp, new_table};

#[derive(Parser)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let status = engine.phi_status().await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            OutputFormat::Table => {
                println!("Arbor Status");
                println!("============\n");

                let mut table = new_table();
                table.set_header(["Category", "Count", "Capacity", "Retention", "Avg Score"]);
                for category in &status.categories {
                    table.add_row([
                        category.category.to_string(),
                        category.count.to_string(),
                        category.capacity.to_string(),
                        category
                            .retention_days
                            .map(|d| format!("{d} days"))
                            .unwrap_or_else(|| "never".to_string()),
                        category
                            .average_score
                            .map(|s| format!("{s:.3}"))
                            .unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                println!("{table}\n");

                println!(
                    "Buffer:  {} / {} entries",
                    status.buffer_count, status.buffer_capacity
                );
                println!("Store:   {} entries", status.store_count);
                println!(
                    "Archive: {} records ({})",
                    status.archive_count,
                    format_size(status.archive_bytes)
                );
                println!(
                    "Consolidation: {}{}",
                    status.consolidation_state,
                    status
                        .last_consolidation
                        .map(|t| format!(", last finished {}", format_timestamp(&t)))
                        .unwrap_or_default()
                );
            }
        }

        Ok(())
    }
}
