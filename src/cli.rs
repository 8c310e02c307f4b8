use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::Settings;

/// Periodically captures the screen, classifies the activity and keeps
/// five-minute and hourly summaries.
#[derive(Parser, Debug)]
#[command(name = "focuslog", version, about)]
pub struct Cli {
    /// Settings file (JSON). Missing files mean defaults.
    #[arg(long, short = 'c', value_name = "PATH", default_value = "focuslog.json")]
    pub config: PathBuf,

    /// SQLite database path, overriding the settings file.
    #[arg(long, short = 'd', value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Capture interval in seconds, overriding the settings file.
    #[arg(long, short = 'i', value_name = "SECS")]
    pub interval: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the capture daemon until Ctrl-C.
    Run,
    /// Summarize every closed window that has captures but no summary.
    Backfill,
    /// Print capture statistics and label usage.
    Stats,
}

impl Cli {
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(database) = &self.database {
            settings.database_path = database.clone();
        }
        if let Some(interval) = self.interval {
            settings.capture_interval_secs = interval;
        }
    }
}
