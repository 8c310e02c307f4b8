use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::{AggregationEngine, Window},
    clock::Clock,
    db::{is_fatal_storage_error, Database, SummaryType},
};

use super::{config::ScheduleConfig, cursor::RollupCursor};

const ENABLE_LOGS: bool = true;

/// A window that fails this many polls in a row (without a fatal storage
/// error) is left unsummarized so later windows are not held up.
const MAX_WINDOW_ATTEMPTS: u32 = 5;

use crate::{log_debug, log_info, log_warn};

pub(crate) struct RollupContext {
    pub engine: AggregationEngine,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub config: ScheduleConfig,
    /// Windows that closed before this instant were missed while the daemon
    /// was down; they are only summarized if something was captured in them.
    pub started_at: DateTime<Utc>,
}

/// Summarizes each window of the cursor's tier once it has closed and the
/// grace period has passed, then persists the cursor.
pub(crate) async fn rollup_loop(
    ctx: RollupContext,
    mut cursor: RollupCursor,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(ctx.config.rollup_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let name = cursor.summary_type().as_str();
    let mut failures = WindowFailures::default();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = roll_due_windows(&ctx, &mut cursor, &mut failures).await {
                    if is_fatal_storage_error(&err) {
                        log::error!("{name} rollup cadence stopping, storage is unusable: {err:#}");
                        return Err(err);
                    }
                    log_warn!("{name} rollup will retry: {err:#}");
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("{name} rollup loop shutting down");
                return Ok(());
            }
        }
    }
}

/// Consecutive failed attempts at the window the cursor is stuck on.
#[derive(Debug, Default)]
struct WindowFailures {
    window_start: Option<DateTime<Utc>>,
    attempts: u32,
}

impl WindowFailures {
    fn record(&mut self, window: &Window) -> u32 {
        if self.window_start != Some(window.start) {
            self.window_start = Some(window.start);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.attempts
    }

    fn clear(&mut self) {
        self.window_start = None;
        self.attempts = 0;
    }
}

async fn roll_due_windows(
    ctx: &RollupContext,
    cursor: &mut RollupCursor,
    failures: &mut WindowFailures,
) -> Result<()> {
    let summary_type = cursor.summary_type();
    let now = ctx.clock.now();
    let mut due = cursor.due_windows(now, ctx.config.rollup_grace)?;

    // An hour is only rolled once every one of its five-minute tiles has been
    // through the five-minute cadence.
    if summary_type == SummaryType::Hourly && !due.is_empty() {
        let tiled_until = ctx
            .db
            .load_cadence_marker(SummaryType::FiveMinute)
            .await
            .context("failed to load five-minute cursor")?
            .map(|marker| marker.last_window_end);
        due.retain(|window| tiled_until.is_some_and(|end| window.end <= end));
        if due.is_empty() {
            log_debug!("hourly rollup waiting for five-minute tiles");
        }
    }

    for window in due {
        if let Err(err) = roll_window(ctx, summary_type, &window).await {
            if is_fatal_storage_error(&err) {
                return Err(err);
            }
            let attempts = failures.record(&window);
            if attempts < MAX_WINDOW_ATTEMPTS {
                return Err(err);
            }
            log::error!(
                "giving up on {} window {} after {attempts} attempts: {err:#}",
                summary_type.as_str(),
                window.start.to_rfc3339()
            );
        }
        failures.clear();

        ctx.db
            .store_cadence_marker(summary_type, window.end, now)
            .await
            .context("failed to persist rollup cursor")?;
        cursor.advance_past(&window);
    }
    Ok(())
}

async fn roll_window(
    ctx: &RollupContext,
    summary_type: SummaryType,
    window: &Window,
) -> Result<()> {
    if window.end <= ctx.started_at {
        let produced = ctx
            .engine
            .summarize_if_observed(summary_type, *window)
            .await
            .with_context(|| format!("backfill of {} failed", window.start.to_rfc3339()))?;
        match produced {
            Some(_) => log_info!(
                "backfilled {} window {}",
                summary_type.as_str(),
                window.start.to_rfc3339()
            ),
            None => log_debug!(
                "no data for missed {} window {}",
                summary_type.as_str(),
                window.start.to_rfc3339()
            ),
        }
    } else {
        ctx.engine
            .summarize(summary_type, *window)
            .await
            .with_context(|| format!("rollup of {} failed", window.start.to_rfc3339()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::db::helpers::format_datetime;
    use chrono::TimeZone;
    use rusqlite::params;
    use std::time::Duration;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, s).unwrap()
    }

    fn context(db: &Database, clock: &MockClock, started_at: DateTime<Utc>) -> RollupContext {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        RollupContext {
            engine: AggregationEngine::new(db.clone(), Arc::clone(&clock)),
            db: db.clone(),
            clock,
            config: ScheduleConfig {
                rollup_grace: Duration::ZERO,
                ..ScheduleConfig::default()
            },
            started_at,
        }
    }

    #[tokio::test]
    async fn hourly_waits_for_five_minute_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("rollup.sqlite3")).unwrap();
        let clock = MockClock::new(at(15, 0, 30));
        let ctx = context(&db, &clock, at(14, 0, 0));
        db.insert_pending_capture(at(14, 10, 0), vec![1]).await.unwrap();

        let mut cursor = RollupCursor::new(SummaryType::Hourly, at(14, 0, 0));
        let mut failures = WindowFailures::default();

        roll_due_windows(&ctx, &mut cursor, &mut failures).await.unwrap();
        assert_eq!(db.count_summaries(SummaryType::Hourly).await.unwrap(), 0);
        assert_eq!(cursor.next_start(), at(14, 0, 0));

        db.store_cadence_marker(SummaryType::FiveMinute, at(14, 55, 0), at(15, 0, 0))
            .await
            .unwrap();
        roll_due_windows(&ctx, &mut cursor, &mut failures).await.unwrap();
        assert_eq!(db.count_summaries(SummaryType::Hourly).await.unwrap(), 0);

        db.store_cadence_marker(SummaryType::FiveMinute, at(15, 0, 0), at(15, 0, 1))
            .await
            .unwrap();
        roll_due_windows(&ctx, &mut cursor, &mut failures).await.unwrap();
        assert_eq!(db.count_summaries(SummaryType::Hourly).await.unwrap(), 1);
        assert_eq!(cursor.next_start(), at(15, 0, 0));
        let marker = db
            .load_cadence_marker(SummaryType::Hourly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.last_window_end, at(15, 0, 0));
    }

    #[tokio::test]
    async fn unreadable_window_is_skipped_after_repeated_failures() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("rollup.sqlite3")).unwrap();
        let clock = MockClock::new(at(9, 10, 0));
        let ctx = context(&db, &clock, at(9, 10, 0));

        // The 09:00 summary row can no longer be decoded.
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO summaries (summary_type, window_start, window_end, content, created_at)
                 VALUES ('five_minute', ?1, ?2, 'not json', ?2)",
                params![format_datetime(&at(9, 0, 0)), format_datetime(&at(9, 5, 0))],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        db.insert_pending_capture(at(9, 6, 0), vec![1]).await.unwrap();

        let mut cursor = RollupCursor::new(SummaryType::FiveMinute, at(9, 0, 0));
        let mut failures = WindowFailures::default();

        for _ in 1..MAX_WINDOW_ATTEMPTS {
            let err = roll_due_windows(&ctx, &mut cursor, &mut failures)
                .await
                .unwrap_err();
            assert!(!is_fatal_storage_error(&err));
            assert_eq!(cursor.next_start(), at(9, 0, 0));
        }

        roll_due_windows(&ctx, &mut cursor, &mut failures).await.unwrap();
        assert_eq!(cursor.next_start(), at(9, 10, 0));

        let next = db
            .get_summaries_in_range(SummaryType::FiveMinute, at(9, 5, 0), at(9, 10, 0))
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].content.as_five_minute().unwrap().capture_count, 1);

        let marker = db
            .load_cadence_marker(SummaryType::FiveMinute)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.last_window_end, at(9, 10, 0));
    }
}
