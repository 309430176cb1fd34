use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use echo_memory::{cli, config, server};

#[derive(Parser)]
#[command(name = "echo-memory", version, about = "Semantic memory and pattern insights for a local-first journal")]
struct Cli {
    /// Config file (defaults to ~/.echo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server
    Serve {
        /// Transport override: stdio or http
        #[arg(long)]
        transport: Option<String>,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Search journal entries
    Search {
        query: String,
        /// Date phrase such as "last week" or "3 days ago"
        #[arg(long)]
        when: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List discovered patterns
    Patterns,
    /// Run a full pattern analysis now
    Analyze,
    /// Embed entries that lack current vectors
    Backfill,
    /// Show engine statistics
    Stats {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check database health
    Doctor,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.echo/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::EchoConfig::load_from(path)?,
        None => config::EchoConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { transport } => {
            if let Some(t) = transport {
                config.server.transport = t;
            }
            server::serve(config).await?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
        Command::Search { query, when, limit } => {
            cli::search::search(&config, &query, when.as_deref(), limit).await?;
        }
        Command::Patterns => cli::patterns::patterns(&config).await?,
        Command::Analyze => cli::patterns::analyze(&config).await?,
        Command::Backfill => cli::backfill::backfill(&config).await?,
        Command::Stats { json } => cli::stats::stats(&config, json)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}
