use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::aggregation::{floor_to, Window};
use crate::db::SummaryType;

/// Where a rollup cadence is: the start of the next window it has not yet
/// summarized. Advancing it is what makes each boundary fire once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupCursor {
    summary_type: SummaryType,
    next_start: DateTime<Utc>,
}

/// Outcome of rebuilding a cursor at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub cursor: RollupCursor,
    /// Closed windows left behind because they fall outside the backfill horizon.
    pub skipped_windows: u64,
}

impl RollupCursor {
    pub fn new(summary_type: SummaryType, next_start: DateTime<Utc>) -> Self {
        Self {
            summary_type,
            next_start,
        }
    }

    /// Rebuilds the cursor from the persisted end of the last completed
    /// window. Without one, rollups start with the window in progress. The
    /// cursor never reaches further back than `max_backfill`.
    pub fn recover(
        summary_type: SummaryType,
        last_window_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        max_backfill: Duration,
    ) -> Result<Recovery> {
        let current = floor_to(summary_type, now)?;
        let Some(last_end) = last_window_end else {
            return Ok(Recovery {
                cursor: Self::new(summary_type, current),
                skipped_windows: 0,
            });
        };

        let horizon = chrono::Duration::from_std(max_backfill)
            .context("backfill horizon is out of range")?;
        let earliest = floor_to(summary_type, now - horizon)?;
        let resume = floor_to(summary_type, last_end)?;

        if resume >= earliest {
            return Ok(Recovery {
                cursor: Self::new(summary_type, resume),
                skipped_windows: 0,
            });
        }

        let span_ms = summary_type.span().num_milliseconds();
        let skipped = (earliest - resume).num_milliseconds() / span_ms;
        Ok(Recovery {
            cursor: Self::new(summary_type, earliest),
            skipped_windows: skipped.max(0) as u64,
        })
    }

    pub fn summary_type(&self) -> SummaryType {
        self.summary_type
    }

    pub fn next_start(&self) -> DateTime<Utc> {
        self.next_start
    }

    /// Windows from the cursor on that closed at least `grace` before `now`.
    pub fn due_windows(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<Window>> {
        let grace = chrono::Duration::from_std(grace).context("rollup grace is out of range")?;
        let mut window = Window::starting_at(self.summary_type, self.next_start)?;
        let mut due = Vec::new();
        while window.end + grace <= now {
            due.push(window);
            window = window.next();
        }
        Ok(due)
    }

    pub fn advance_past(&mut self, window: &Window) {
        if window.end > self.next_start {
            self.next_start = window.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, d, h, m, s).unwrap()
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn fresh_cursor_starts_at_current_window() {
        let recovery =
            RollupCursor::recover(SummaryType::FiveMinute, None, at(19, 9, 7, 0), DAY).unwrap();
        assert_eq!(recovery.cursor.next_start(), at(19, 9, 5, 0));
        assert!(recovery
            .cursor
            .due_windows(at(19, 9, 7, 0), Duration::ZERO)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn restart_resumes_after_last_completed_window() {
        let recovery = RollupCursor::recover(
            SummaryType::FiveMinute,
            Some(at(19, 8, 30, 0)),
            at(19, 9, 1, 0),
            DAY,
        )
        .unwrap();
        assert_eq!(recovery.skipped_windows, 0);

        let due = recovery
            .cursor
            .due_windows(at(19, 9, 1, 0), Duration::from_secs(65))
            .unwrap();
        // 08:30 through 08:50 are closed and past the grace; 08:55 ends at
        // 09:00 and is still inside it.
        assert_eq!(due.len(), 5);
        assert_eq!(due[0].start, at(19, 8, 30, 0));
        assert_eq!(due[4].start, at(19, 8, 50, 0));
    }

    #[test]
    fn backfill_stops_at_horizon() {
        let recovery = RollupCursor::recover(
            SummaryType::Hourly,
            Some(at(15, 3, 0, 0)),
            at(19, 12, 30, 0),
            DAY,
        )
        .unwrap();
        assert_eq!(recovery.cursor.next_start(), at(18, 12, 0, 0));
        // 15th 03:00 up to 18th 12:00.
        assert_eq!(recovery.skipped_windows, 3 * 24 + 9);
    }

    #[test]
    fn advancing_consumes_each_window_once() {
        let mut cursor = RollupCursor::new(SummaryType::FiveMinute, at(19, 9, 0, 0));
        let now = at(19, 9, 11, 0);

        let due = cursor.due_windows(now, Duration::ZERO).unwrap();
        assert_eq!(due.len(), 2);
        for window in &due {
            cursor.advance_past(window);
        }
        assert!(cursor.due_windows(now, Duration::ZERO).unwrap().is_empty());

        // A stale window never moves the cursor back.
        cursor.advance_past(&due[0]);
        assert_eq!(cursor.next_start(), at(19, 9, 10, 0));
    }
}
