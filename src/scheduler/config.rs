use std::time::Duration;

use anyhow::{bail, Result};

use crate::db::SummaryType;

/// Timing for the three cadences and for shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub capture_interval: Duration,
    /// Upper bound on one snapshot acquisition.
    pub capture_timeout: Duration,
    /// Upper bound on one classification call.
    pub classification_timeout: Duration,
    /// Delay after a boundary before its window is summarized, so that
    /// classifications for the closing window can land first.
    pub rollup_grace: Duration,
    /// How often the rollup cadences check for closed windows.
    pub rollup_poll_interval: Duration,
    /// Closed windows older than this are not backfilled after a restart.
    pub max_backfill: Duration,
    /// How long in-flight classifications get to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let classification_timeout = Duration::from_secs(60);
        Self {
            capture_interval: Duration::from_secs(15),
            capture_timeout: Duration::from_secs(10),
            classification_timeout,
            rollup_grace: default_rollup_grace(classification_timeout),
            rollup_poll_interval: Duration::from_secs(1),
            max_backfill: Duration::from_secs(24 * 60 * 60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub fn default_rollup_grace(classification_timeout: Duration) -> Duration {
    classification_timeout + Duration::from_secs(5)
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        let interval_ms = self.capture_interval.as_millis();
        if interval_ms == 0 {
            bail!("capture interval must be positive");
        }

        // The hourly boundary is a multiple of the five-minute one, so checking
        // the smaller span covers both.
        let five_minutes_ms = SummaryType::FiveMinute.span().num_milliseconds() as u128;
        if five_minutes_ms % interval_ms != 0 {
            bail!(
                "capture interval of {}ms does not divide the five-minute boundary",
                interval_ms
            );
        }

        if self.capture_timeout.is_zero() {
            bail!("capture timeout must be positive");
        }
        if self.classification_timeout.is_zero() {
            bail!("classification timeout must be positive");
        }
        if self.rollup_poll_interval.is_zero() {
            bail!("rollup poll interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ScheduleConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rollup_grace, Duration::from_secs(65));
    }

    #[test]
    fn interval_must_divide_boundaries() {
        let mut config = ScheduleConfig::default();

        config.capture_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config.capture_interval = Duration::from_secs(7);
        assert!(config.validate().is_err());

        for secs in [1, 5, 10, 20, 30, 60, 300] {
            config.capture_interval = Duration::from_secs(secs);
            assert!(config.validate().is_ok(), "{secs}s should be accepted");
        }

        config.capture_interval = Duration::from_millis(1500);
        assert!(config.validate().is_ok());
    }
}
