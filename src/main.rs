//! # ragserve CLI
//!
//! Entry point for the RAG search service.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragserve init` | Create the SQLite database and run schema migrations |
//! | `ragserve serve` | Start the HTTP API server |
//!
//! All commands accept a `--config` flag pointing to a TOML configuration
//! file. See `config/ragserve.example.toml` for a full example.
//!
//! ```bash
//! ragserve --config ./config/ragserve.toml init
//! ragserve --config ./config/ragserve.toml serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ragserve::{config, db, logging, migrate, server, AppContext};

/// ragserve: RAG-as-a-Service with hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "ragserve",
    about = "RAG search service: ingest documents, search with hybrid vector + BM25 retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragserve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Runs migrations on startup, connects the object store and model
    /// providers, and serves until terminated.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            let ctx = AppContext::from_config(config).await?;
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}
