use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod clock;
mod commands;
mod config;
mod controllers;
mod error;
mod ids;
mod models;
mod storage;
mod types;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::storage::PasteStore;
pub(crate) use error::AppResult;

/// Everything a request handler or command needs.
#[derive(Clone, FromRef)]
pub struct App {
    config: Config,
    /// `None` when no store is configured.
    pastes: Option<PasteStore>,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Connect to the configured store. The connection is reused for the
    /// life of the process.
    async fn new(config: Config) -> anyhow::Result<Self> {
        let ttl_grace = Duration::from_secs(config.storage.ttl_grace_secs);
        let pastes = storage::open(&config.storage)
            .await?
            .map(|backend| PasteStore::new(backend, ttl_grace));

        Ok(App {
            config,
            pastes,
            clock: Arc::new(SystemClock),
        })
    }
}

#[derive(Parser)]
#[command(version, about = "Share text that disappears")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Delete evicted entries from file storage.
    PurgeExpired,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // try to load .env, ignoring any errors
    _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let app = App::new(config).await?;

    match cli.command {
        Command::Serve => commands::serve::run(app).await,
        Command::PurgeExpired => commands::purge_expired::run(app).await,
    }
}
