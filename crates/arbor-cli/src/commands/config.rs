use std::path::Path;

use arbor::Config;
use clap::{Parser, Subcommand};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ConfigCommand {
    #[clap(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    #[clap(about = "Show the effective configuration")]
    Show,

    #[clap(about = "List the locations searched for a config file")]
    Path,
}

impl ConfigCommand {
    pub fn execute(&self, config: &Config, explicit: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            ConfigSubcommand::Show => Self::show(config, format),
            ConfigSubcommand::Path => Self::path(explicit, format),
        }
    }

    fn show(config: &Config, format: OutputFormat) -> CliResult<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
            OutputFormat::Table => print!("{}", toml::to_string_pretty(config)?),
        }
        Ok(())
    }

    fn path(explicit: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        let candidates = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => Config::default_paths(),
        };
        let active = candidates.iter().find(|p| p.exists());

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "searched": candidates,
                    "active": active,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                for path in &candidates {
                    let marker = if Some(path) == active { "*" } else { " " };
                    println!("{marker} {}", path.display());
                }
                if active.is_none() {
                    println!("\nNo config file found; using defaults.");
                }
            }
        }
        Ok(())
    }
}
