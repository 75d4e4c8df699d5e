use arbor::MemoryEngine;
use clap::Parser;

use crate::error::{CliError, CliResult};
use crate::output::{EntryView, OutputFormat, entries_table, entry_detail_table, parse_id};

#[derive(Parser)]
pub struct GetCommand {
    #[clap(help = "Entry ID (UUID format)")]
    pub id: String,

    #[clap(long, help = "Also list the entry's children")]
    pub children: bool,
}

impl GetCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&self.id)?;

        let found = engine
            .get(id)
            .await?
            .ok_or_else(|| CliError::not_found("Entry", &self.id))?;
        let children = if self.children {
            engine.children_of(id).await?
        } else {
            Vec::new()
        };

        match format {
            OutputFormat::Json => {
                let mut output = serde_json::to_value(EntryView::from(&found))?;
                if self.children {
                    let views: Vec<EntryView> = children.iter().map(EntryView::from).collect();
                    output["children"] = serde_json::to_value(views)?;
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("{}", entry_detail_table(&found));
                if self.children {
                    if children.is_empty() {
                        println!("\nNo live children.");
                    } else {
                        println!("\nChildren:\n{}", entries_table(&children));
                    }
                }
            }
        }

        Ok(())
    }
}
