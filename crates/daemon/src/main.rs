// loamd: runs the outbox and sync loops against the central service.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use loam_daemon::config::EngineConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "loamd", about = "Local-first replication engine")]
struct Cli {
    /// Config file to use instead of `~/.loam/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the database path from the config.
    #[arg(long)]
    database: Option<PathBuf>,
    /// Sync only this root (repeatable).
    #[arg(long = "root")]
    roots: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
    .context("failed to load config")?;
    if cli.database.is_some() {
        config.database_path = cli.database;
    }
    if !cli.roots.is_empty() {
        config.sync.roots = cli.roots;
    }

    info!("starting loam engine");
    loam_daemon::runtime::run_standalone(config)
        .await
        .context("loam engine terminated unexpectedly")
}
