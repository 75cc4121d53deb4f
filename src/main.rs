mod ai;
mod cli;
mod config;
mod context;
mod db;
mod engine;
mod error;
mod events;
mod memory;
mod metrics;
mod modes;
mod pipeline;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memory::search::SearchStrategy;
use memory::types::ObservationType;

#[derive(Parser)]
#[command(
    name = "open-mem",
    version,
    about = "Local-first persistent memory engine for AI coding assistants"
)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show memory statistics for the project
    Stats,
    /// Search observations
    Search {
        query: String,
        /// Retrieval strategy: filter-only, semantic, or hybrid
        #[arg(long, default_value = "hybrid")]
        strategy: SearchStrategy,
        /// Filter by concept (repeatable)
        #[arg(long = "concept")]
        concepts: Vec<String>,
        /// Filter by file path (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Export active observations as JSON to stdout
    Export {
        /// Only export observations of this type
        #[arg(long = "type")]
        observation_type: Option<ObservationType>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Import observations from a JSON export file
    Import {
        file: PathBuf,
        /// Clear the database before importing
        #[arg(long)]
        overwrite: bool,
    },
    /// Run database diagnostics
    Doctor,
    /// Drain the pending capture queue once
    Process,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project_dir = match cli.project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let config = config::MemConfig::load(&project_dir)?;
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let engine = cli::open_engine(&project_dir)?;

    match cli.command {
        Command::Stats => cli::stats::stats(&engine)?,
        Command::Search {
            query,
            strategy,
            concepts,
            files,
            limit,
        } => cli::search::search(&engine, &query, strategy, concepts, files, limit).await?,
        Command::Export {
            observation_type,
            limit,
        } => cli::export::export(&engine, observation_type, limit)?,
        Command::Import { file, overwrite } => cli::import::import(&engine, &file, overwrite)?,
        Command::Doctor => cli::doctor::doctor(&engine)?,
        Command::Process => cli::process::process(&engine).await?,
    }

    Ok(())
}
