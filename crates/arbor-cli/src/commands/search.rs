use arbor::{Category, MemoryEngine, RetrieveQuery};
use clap::Parser;

use crate::error::CliResult;
use crate::output::{EntryView, OutputFormat, entries_table};

#[derive(Parser)]
pub struct SearchCommand {
    #[clap(help = "Case-insensitive text the content must contain")]
    pub text: Option<String>,

    #[clap(long = "tag", short, help = "Required tag; repeat to require several")]
    pub tags: Vec<String>,

    #[clap(
        long = "category",
        short = 'C',
        help = "Restrict to a category; repeat for several"
    )]
    pub categories: Vec<Category>,

    #[clap(
        long,
        short,
        default_value = "20",
        help = "Maximum number of entries to display"
    )]
    pub limit: usize,

    #[clap(long, help = "Also search the encrypted archive (slow)")]
    pub archive: bool,
}

impl SearchCommand {
    fn query(&self) -> RetrieveQuery {
        let needle = self.text.as_ref().map(|t| t.to_lowercase());
        let tags = self.tags.clone();

        let mut query = RetrieveQuery::new()
            .matching(move |entry| {
                let text_ok = needle
                    .as_ref()
                    .is_none_or(|n| entry.content.to_lowercase().contains(n.as_str()));
                text_ok && tags.iter().all(|t| entry.tags.contains(t))
            })
            .limit(self.limit)
            .include_archive(self.archive);
        if !self.categories.is_empty() {
            query = query.in_categories(self.categories.iter().copied());
        }
        query
    }

    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let results = engine.retrieve(self.query()).await?;

        match format {
            OutputFormat::Json => {
                let output: Vec<EntryView> = results.iter().map(EntryView::from).collect();
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if results.is_empty() {
                    println!("No entries found.");
                    return Ok(());
                }
                println!("{}", entries_table(&results));
                println!("\nTotal: {} entries", results.len());
            }
        }

        Ok(())
    }
}
