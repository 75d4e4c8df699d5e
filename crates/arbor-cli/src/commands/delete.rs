use arbor::MemoryEngine;
use clap::Parser;

use crate::error::CliResult;
use crate::output::{OutputFormat, parse_id};

#[derive(Parser)]
pub struct DeleteCommand {
    #[clap(help = "Entry ID to delete (UUID format)")]
    pub id: String,
}

impl DeleteCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&self.id)?;
        let deleted = engine.delete(id).await?;
        let archived = engine.archive().contains(id);

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": self.id,
                    "deleted": deleted,
                    "archived_copy": archived,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if deleted {
                    println!("Entry {} deleted successfully.", self.id);
                    if archived {
                        println!("An archived copy is kept.");
                    }
                } else {
                    println!("Entry {} not found.", self.id);
                }
            }
        }

        Ok(())
    }
}
