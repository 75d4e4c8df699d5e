use std::path::PathBuf;

use arbor::{Config, MasterSecret, MemoryEngine};
use arbor_cli::commands::{
    ConfigCommand, ConsolidateCommand, DeleteCommand, FlushCommand, GetCommand, SearchCommand,
    StatusCommand, StoreCommand,
};
use arbor_cli::error::CliResult;
use arbor_cli::output::OutputFormat;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Arbor CLI - Manage a tiered memory store")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Store a new entry")]
    Store(StoreCommand),

    #[clap(about = "Show an entry from any tier")]
    Get(GetCommand),

    #[clap(about = "Search entries, newest first")]
    Search(SearchCommand),

    #[clap(about = "Delete an entry (archived copies are kept)")]
    Delete(DeleteCommand),

    #[clap(about = "Move buffered entries into the store")]
    Flush(FlushCommand),

    #[clap(about = "Run a consolidation pass")]
    Consolidate(ConsolidateCommand),

    #[clap(about = "Show tier occupancy and scores")]
    Status(StatusCommand),

    #[clap(about = "Configuration commands")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load_or_discover(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    if let Command::Config(cmd) = &cli.command {
        return cmd.execute(&config, cli.config.as_deref(), format);
    }

    tracing::debug!("Using data directory {}", config.storage.data_dir.display());
    let secret = MasterSecret::from_env(&config.archive.master_secret_env)?;
    let engine = MemoryEngine::open(config, secret).await?;

    let result = match &cli.command {
        Command::Store(cmd) => cmd.execute(&engine, format).await,
        Command::Get(cmd) => cmd.execute(&engine, format).await,
        Command::Search(cmd) => cmd.execute(&engine, format).await,
        Command::Delete(cmd) => cmd.execute(&engine, format).await,
        Command::Flush(cmd) => cmd.execute(&engine, format).await,
        Command::Consolidate(cmd) => cmd.execute(&engine, format).await,
        Command::Status(cmd) => cmd.execute(&engine, format).await,
        Command::Config(_) => Ok(()),
    };

    // The buffer does not outlive the process
    engine.shutdown().await?;
    result
}
