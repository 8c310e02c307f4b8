//! Window aggregation: turns captures into five-minute summaries and
//! five-minute summaries into hourly ones.
//!
//! Every call works on one aligned, closed window inside one transaction and
//! is idempotent: once a summary row exists for (type, window start) it is
//! returned as stored and never recomputed.

pub mod config;
pub mod five_minute;
pub mod hourly;
pub mod tally;
pub mod window;

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::clock::Clock;
use crate::db::{
    models::Coverage,
    repositories::{CaptureRepository, SummaryRepository},
    Database, Summary, SummaryContent, SummaryType,
};

pub use config::AggregationConfig;
pub use five_minute::compose_five_minute;
pub use hourly::compose_hourly;
pub use window::{closed_windows_between, floor_to, Window};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Clone)]
pub struct AggregationEngine {
    db: Database,
    clock: Arc<dyn Clock>,
    config: Arc<AggregationConfig>,
}

impl AggregationEngine {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(db, clock, AggregationConfig::default())
    }

    pub fn with_config(db: Database, clock: Arc<dyn Clock>, config: AggregationConfig) -> Self {
        Self {
            db,
            clock,
            config: Arc::new(config),
        }
    }

    /// Returns the summary for `window`, creating it if this is the first
    /// request. An empty window still gets a summary.
    pub async fn summarize(&self, summary_type: SummaryType, window: Window) -> Result<Summary> {
        match self.run(summary_type, window, false).await? {
            Some(summary) => Ok(summary),
            None => bail!("no summary produced for {}", window.start.to_rfc3339()),
        }
    }

    /// Like `summarize`, but leaves a window with no underlying data alone
    /// and returns `None`. Backfill uses this so time the daemon was not
    /// running is not recorded as observed.
    pub async fn summarize_if_observed(
        &self,
        summary_type: SummaryType,
        window: Window,
    ) -> Result<Option<Summary>> {
        self.run(summary_type, window, true).await
    }

    async fn run(
        &self,
        summary_type: SummaryType,
        window: Window,
        require_data: bool,
    ) -> Result<Option<Summary>> {
        let now = self.clock.now();
        validate_window(summary_type, &window, now)?;

        let config = Arc::clone(&self.config);
        self.db
            .transaction(move |tx| {
                summarize_in(tx, summary_type, window, now, &config, require_data)
            })
            .await
    }
}

fn validate_window(summary_type: SummaryType, window: &Window, now: DateTime<Utc>) -> Result<()> {
    if summary_type == SummaryType::Daily {
        bail!("daily summaries are not implemented");
    }
    let aligned = Window::starting_at(summary_type, window.start)?;
    if aligned.end != window.end {
        bail!(
            "window {} - {} is not one {} window",
            window.start.to_rfc3339(),
            window.end.to_rfc3339(),
            summary_type.as_str()
        );
    }
    if !window.is_closed(now) {
        bail!(
            "window ending {} is still open at {}",
            window.end.to_rfc3339(),
            now.to_rfc3339()
        );
    }
    Ok(())
}

fn summarize_in(
    conn: &Connection,
    summary_type: SummaryType,
    window: Window,
    now: DateTime<Utc>,
    config: &AggregationConfig,
    require_data: bool,
) -> Result<Option<Summary>> {
    let summaries = SummaryRepository::new(conn);
    if let Some(existing) = summaries.find(summary_type, window.start)? {
        log_debug!(
            "{} summary for {} already exists",
            summary_type.as_str(),
            window.start.to_rfc3339()
        );
        return Ok(Some(existing));
    }

    let content = match summary_type {
        SummaryType::FiveMinute => {
            let captures = CaptureRepository::new(conn).in_range(window.start, window.end, false)?;
            if require_data && captures.is_empty() {
                return Ok(None);
            }
            SummaryContent::FiveMinute(compose_five_minute(&window, &captures, config))
        }
        SummaryType::Hourly => {
            let captures = CaptureRepository::new(conn);
            let mut tiles = Vec::new();
            for tile in window.tiles(SummaryType::FiveMinute)? {
                // A tile without captures is a gap whether or not an empty
                // five-minute summary was stored for it.
                let content = match summaries.find(SummaryType::FiveMinute, tile.start)? {
                    Some(summary) => summary
                        .content
                        .as_five_minute()
                        .filter(|content| content.capture_count > 0)
                        .cloned(),
                    None if captures.count_in_range(tile.start, tile.end)? > 0 => {
                        log_info!(
                            "generating missing five-minute summary for {}",
                            tile.start.to_rfc3339()
                        );
                        summarize_in(conn, SummaryType::FiveMinute, tile, now, config, true)?
                            .and_then(|summary| summary.content.as_five_minute().cloned())
                    }
                    None => None,
                };
                tiles.push((tile, content));
            }

            if require_data && tiles.iter().all(|(_, content)| content.is_none()) {
                return Ok(None);
            }

            let content = compose_hourly(&window, &tiles, config);
            if content.coverage == Coverage::Partial {
                log_warn!(
                    "hour {} has partial coverage: {} of {} windows",
                    window.start.to_rfc3339(),
                    content.covered_windows,
                    content.expected_windows
                );
            }
            SummaryContent::Hourly(content)
        }
        SummaryType::Daily => bail!("daily summaries are not implemented"),
    };

    let summary = summaries.insert_if_absent(summary_type, window.start, window.end, &content, now)?;
    log_info!(
        "{} summary stored for {}",
        summary_type.as_str(),
        window.start.to_rfc3339()
    );
    Ok(Some(summary))
}
