pub mod aggregation;
pub mod capture;
pub mod classification;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod db;
pub mod labels;
pub mod scheduler;
pub mod settings;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command};
use settings::Settings;

pub fn run() -> Result<()> {
    // Load .env if present; the API key usually lives there.
    dotenvy::dotenv().ok();

    // Initialize logging (reads RUST_LOG, info by default)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)?;
    cli.apply_overrides(&mut settings);

    log::info!("focuslog starting up ({:?})", cli.command);

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        match cli.command {
            Command::Run => commands::run_daemon(&settings).await,
            Command::Backfill => commands::run_backfill(&settings).await,
            Command::Stats => commands::run_stats(&settings).await,
        }
    })
}
