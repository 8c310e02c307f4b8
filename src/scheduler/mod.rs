//! Cadence scheduler: runs the capture cadence and the two rollup cadences
//! as independent tasks over one clock and one database.

mod capture_loop;
pub mod config;
pub mod cursor;
mod rollup_loop;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregation::AggregationEngine,
    capture::SnapshotSource,
    classification::ClassificationDispatcher,
    clock::Clock,
    db::{Database, SummaryType},
};

use capture_loop::{capture_loop, CaptureContext};
use rollup_loop::{rollup_loop, RollupContext};

pub use config::{default_rollup_grace, ScheduleConfig};
pub use cursor::{Recovery, RollupCursor};

pub struct Scheduler {
    db: Database,
    clock: Arc<dyn Clock>,
    source: Arc<dyn SnapshotSource>,
    dispatcher: ClassificationDispatcher,
    engine: AggregationEngine,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        source: Arc<dyn SnapshotSource>,
        dispatcher: ClassificationDispatcher,
        engine: AggregationEngine,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            db,
            clock,
            source,
            dispatcher,
            engine,
            config,
        }
    }

    /// Validates the configuration, restores the rollup cursors and spawns
    /// the three cadences.
    pub async fn start(self) -> Result<SchedulerHandle> {
        self.config.validate()?;

        let started_at = self.clock.now();
        let failed = self.dispatcher.failure_token();

        let mut rollups = Vec::new();
        for summary_type in [SummaryType::FiveMinute, SummaryType::Hourly] {
            let marker = self
                .db
                .load_cadence_marker(summary_type)
                .await
                .with_context(|| format!("failed to load {} cursor", summary_type.as_str()))?;
            let recovery = RollupCursor::recover(
                summary_type,
                marker.map(|marker| marker.last_window_end),
                started_at,
                self.config.max_backfill,
            )?;
            if recovery.skipped_windows > 0 {
                warn!(
                    "skipping {} {} windows older than the {}h backfill horizon",
                    recovery.skipped_windows,
                    summary_type.as_str(),
                    self.config.max_backfill.as_secs() / 3600
                );
            }
            info!(
                "{} rollups resume at {}",
                summary_type.as_str(),
                recovery.cursor.next_start().to_rfc3339()
            );

            let ctx = RollupContext {
                engine: self.engine.clone(),
                db: self.db.clone(),
                clock: Arc::clone(&self.clock),
                config: self.config.clone(),
                started_at,
            };
            rollups.push(CadenceTask::spawn(
                summary_type.as_str(),
                failed.clone(),
                |token| rollup_loop(ctx, recovery.cursor, token),
            ));
        }

        let ctx = CaptureContext {
            source: self.source,
            db: self.db.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        };
        let capture = CadenceTask::spawn("capture", failed.clone(), |token| capture_loop(ctx, token));

        info!(
            "scheduler started: capturing every {}s",
            self.config.capture_interval.as_secs_f32()
        );

        Ok(SchedulerHandle {
            capture,
            rollups,
            dispatcher: self.dispatcher,
            shutdown_grace: self.config.shutdown_grace,
            failed,
        })
    }
}

struct CadenceTask {
    name: &'static str,
    cancel_token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl CadenceTask {
    /// Spawns a cadence. If it ends with an error, `failed` is cancelled so
    /// whoever waits on the scheduler learns about it.
    fn spawn<F, Fut>(name: &'static str, failed: CancellationToken, make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let task = make(cancel_token.clone());
        let handle = tokio::spawn(async move {
            let result = task.await;
            if result.is_err() {
                failed.cancel();
            }
            result
        });
        Self {
            name,
            cancel_token,
            handle,
        }
    }

    async fn stop(self) -> Result<()> {
        self.cancel_token.cancel();
        self.handle
            .await
            .with_context(|| format!("{} cadence task failed to join", self.name))?
            .with_context(|| format!("{} cadence failed", self.name))
    }
}

/// What shutdown had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub aborted_classifications: usize,
}

pub struct SchedulerHandle {
    capture: CadenceTask,
    rollups: Vec<CadenceTask>,
    dispatcher: ClassificationDispatcher,
    shutdown_grace: std::time::Duration,
    failed: CancellationToken,
}

impl SchedulerHandle {
    /// Resolves once any cadence has stopped on a fatal error, or a
    /// classification result could not be stored for the same reason.
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Stops capturing, then the rollups, then gives in-flight
    /// classifications the shutdown grace before aborting them. Returns the
    /// first cadence error, if any cadence died.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        let mut first_error = None;

        if let Err(err) = self.capture.stop().await {
            first_error.get_or_insert(err);
        }
        for rollup in self.rollups {
            if let Err(err) = rollup.stop().await {
                first_error.get_or_insert(err);
            }
        }

        let aborted_classifications = match self.dispatcher.shutdown(self.shutdown_grace).await {
            Ok(aborted) => aborted,
            Err(err) => {
                first_error.get_or_insert(err);
                0
            }
        };

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("scheduler stopped");
                Ok(ShutdownReport {
                    aborted_classifications,
                })
            }
        }
    }
}
