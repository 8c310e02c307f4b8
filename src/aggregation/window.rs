use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};

use crate::db::SummaryType;

/// A half-open `[start, end)` span aligned to a summary tier's UTC buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// The window of `summary_type` that contains `at`.
    pub fn containing(summary_type: SummaryType, at: DateTime<Utc>) -> Result<Self> {
        let start = floor_to(summary_type, at)?;
        Ok(Self {
            start,
            end: start + summary_type.span(),
        })
    }

    /// The window starting at `start`, which must sit on a bucket boundary.
    pub fn starting_at(summary_type: SummaryType, start: DateTime<Utc>) -> Result<Self> {
        if !is_aligned(summary_type, start)? {
            bail!(
                "{} is not aligned to a {} boundary",
                start.to_rfc3339(),
                summary_type.as_str()
            );
        }
        Ok(Self {
            start,
            end: start + summary_type.span(),
        })
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// The adjacent window of the same length.
    pub fn next(&self) -> Self {
        Self {
            start: self.end,
            end: self.end + self.span(),
        }
    }

    /// Splits this window into consecutive `child` windows. The window must
    /// be a whole number of child spans.
    pub fn tiles(&self, child: SummaryType) -> Result<Vec<Window>> {
        let step = child.span();
        let span_ms = self.span().num_milliseconds();
        let step_ms = step.num_milliseconds();
        if step_ms <= 0 || span_ms % step_ms != 0 || !is_aligned(child, self.start)? {
            bail!(
                "window {} - {} cannot be tiled by {} windows",
                self.start.to_rfc3339(),
                self.end.to_rfc3339(),
                child.as_str()
            );
        }

        let mut tiles = Vec::with_capacity((span_ms / step_ms) as usize);
        let mut start = self.start;
        while start < self.end {
            tiles.push(Window {
                start,
                end: start + step,
            });
            start += step;
        }
        Ok(tiles)
    }
}

/// Rounds `at` down to the start of its `summary_type` bucket. Buckets are
/// counted from the Unix epoch, so they line up with UTC wall-clock minutes,
/// hours and days.
pub fn floor_to(summary_type: SummaryType, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let span = summary_type.span().num_milliseconds();
    let floored = at.timestamp_millis().div_euclid(span) * span;
    DateTime::<Utc>::from_timestamp_millis(floored)
        .ok_or_else(|| anyhow!("timestamp {floored}ms is out of range"))
}

pub fn is_aligned(summary_type: SummaryType, at: DateTime<Utc>) -> Result<bool> {
    Ok(floor_to(summary_type, at)? == at)
}

/// All closed windows of `summary_type` that start at or after `from` and end
/// at or before `now`, oldest first.
pub fn closed_windows_between(
    summary_type: SummaryType,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<Window>> {
    let mut window = Window::containing(summary_type, from)?;
    if window.start < from {
        window = window.next();
    }

    let mut windows = Vec::new();
    while window.is_closed(now) {
        windows.push(window);
        window = window.next();
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, s).unwrap()
    }

    #[test]
    fn containing_floors_to_utc_buckets() {
        let window = Window::containing(SummaryType::FiveMinute, at(9, 7, 42)).unwrap();
        assert_eq!(window.start, at(9, 5, 0));
        assert_eq!(window.end, at(9, 10, 0));

        let hour = Window::containing(SummaryType::Hourly, at(9, 59, 59)).unwrap();
        assert_eq!(hour.start, at(9, 0, 0));
        assert_eq!(hour.end, at(10, 0, 0));

        let boundary = Window::containing(SummaryType::FiveMinute, at(9, 10, 0)).unwrap();
        assert_eq!(boundary.start, at(9, 10, 0));
    }

    #[test]
    fn misaligned_start_is_rejected() {
        assert!(Window::starting_at(SummaryType::FiveMinute, at(9, 5, 0)).is_ok());
        assert!(Window::starting_at(SummaryType::FiveMinute, at(9, 6, 0)).is_err());
        assert!(Window::starting_at(SummaryType::Hourly, at(9, 5, 0)).is_err());
    }

    #[test]
    fn hour_tiles_into_twelve_consecutive_windows() {
        let hour = Window::starting_at(SummaryType::Hourly, at(14, 0, 0)).unwrap();
        let tiles = hour.tiles(SummaryType::FiveMinute).unwrap();

        assert_eq!(tiles.len(), 12);
        assert_eq!(tiles[0].start, hour.start);
        assert_eq!(tiles[11].end, hour.end);
        assert!(tiles.windows(2).all(|pair| pair[0].end == pair[1].start));
    }

    #[test]
    fn closed_windows_skip_the_open_one() {
        let windows =
            closed_windows_between(SummaryType::FiveMinute, at(9, 2, 0), at(9, 21, 0)).unwrap();
        let starts: Vec<_> = windows.iter().map(|w| w.start).collect();
        assert_eq!(starts, vec![at(9, 5, 0), at(9, 10, 0), at(9, 15, 0)]);

        assert!(!Window::containing(SummaryType::FiveMinute, at(9, 21, 0))
            .unwrap()
            .is_closed(at(9, 21, 0)));
    }
}
