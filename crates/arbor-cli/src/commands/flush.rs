use arbor::MemoryEngine;
use clap::Parser;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct FlushCommand {}

impl FlushCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let moved = engine.flush().await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({ "moved": moved });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Moved {moved} entries from the buffer into the store.");
            }
        }

        Ok(())
    }
}
