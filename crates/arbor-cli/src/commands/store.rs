use arbor::{Category, MemoryEngine, StoreRequest};
use clap::Parser;

use crate::error::CliResult;
use crate::output::{OutputFormat, parse_id};

#[derive(Parser)]
pub struct StoreCommand {
    #[clap(help = "Entry content")]
    pub content: String,

    #[clap(
        long,
        short = 'C',
        default_value = "seed",
        help = "Category (seed, leaf, branch, root)"
    )]
    pub category: Category,

    #[clap(long = "tag", short, help = "Tag to attach; repeat for several")]
    pub tags: Vec<String>,

    #[clap(long, default_value = "0.0", help = "Relatedness to existing entries, 0 to 1")]
    pub resonance: f64,

    #[clap(long, default_value = "0.0", help = "Emotional intensity, 0 to 1")]
    pub intensity: f64,

    #[clap(
        long,
        default_value = "0.0",
        allow_hyphen_values = true,
        help = "Emotional valence, -1 to 1"
    )]
    pub valence: f64,

    #[clap(long, help = "Explicit structural weight")]
    pub weight: Option<f64>,

    #[clap(long, help = "Mark as foundational input", conflicts_with = "weight")]
    pub foundational: bool,

    #[clap(long, help = "Parent entry ID (UUID format)")]
    pub parent: Option<String>,
}

impl StoreCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let mut request = StoreRequest::new(self.category, self.content.clone())
            .with_tags(self.tags.iter().cloned())
            .with_resonance(self.resonance)
            .with_emotion(self.intensity, self.valence);
        if let Some(weight) = self.weight {
            request = request.with_structural_weight(weight);
        }
        if self.foundational {
            request = request.foundational();
        }
        if let Some(parent) = &self.parent {
            request = request.with_parent(parse_id(parent)?);
        }

        let id = engine.store(request).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": id.to_string(),
                    "category": self.category,
                    "created": true,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Entry stored in {}.", self.category);
                println!("ID: {id}");
            }
        }

        Ok(())
    }
}
