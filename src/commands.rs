//! The `run`, `backfill` and `stats` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::{
    aggregation::{closed_windows_between, floor_to, AggregationEngine},
    capture::CommandSource,
    classification::{fail_orphaned_captures, ClassificationDispatcher, OpenAiClassifier, Reconciler},
    clock::{Clock, SystemClock},
    db::{Database, SummaryType},
    labels::LabelRegistry,
    scheduler::Scheduler,
    settings::Settings,
};

pub async fn run_daemon(settings: &Settings) -> Result<()> {
    let schedule = settings.schedule()?;
    let db = Database::new(settings.database_path.clone())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let reconciler = Reconciler::new(db.clone(), Arc::clone(&clock));
    fail_orphaned_captures(&db, &reconciler)
        .await
        .context("failed to recover pending captures")?;

    let classifier = OpenAiClassifier::new(settings.openai()?)
        .context("failed to build classification client")?;
    let source = CommandSource::new(&settings.capture_command, schedule.capture_timeout)
        .context("invalid capture command")?;

    let dispatcher = ClassificationDispatcher::new(
        Arc::new(classifier),
        reconciler,
        db.clone(),
        schedule.classification_timeout,
    );
    let engine = AggregationEngine::new(db.clone(), Arc::clone(&clock));

    let handle = Scheduler::new(
        db.clone(),
        clock,
        Arc::new(source),
        dispatcher,
        engine,
        schedule,
    )
    .start()
    .await?;

    info!("focuslog running; press Ctrl-C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!("failed to listen for Ctrl-C: {err}");
            }
            info!("shutdown requested");
        }
        _ = handle.failed() => {
            error!("a cadence stopped on a fatal error; shutting down");
        }
    }

    let outcome = handle.shutdown().await;
    if let Ok(report) = &outcome {
        if report.aborted_classifications > 0 {
            warn!(
                "{} classifications were aborted at shutdown",
                report.aborted_classifications
            );
        }
    }

    if let Err(err) = print_stats(&db).await {
        warn!("could not read final statistics: {err:#}");
    }

    outcome.map(|_| ())
}

/// Summaries present after a backfill, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub five_minute: usize,
    pub hourly: usize,
}

/// Walks every closed window from the first capture to now and summarizes
/// the ones that have data. Safe to run repeatedly.
pub async fn backfill(
    db: &Database,
    engine: &AggregationEngine,
    clock: &dyn Clock,
) -> Result<BackfillReport> {
    let stats = db.get_capture_stats().await?;
    let Some(first_capture) = stats.first_capture else {
        info!("no captures yet; nothing to backfill");
        return Ok(BackfillReport::default());
    };

    let now = clock.now();
    let mut report = BackfillReport::default();

    for summary_type in [SummaryType::FiveMinute, SummaryType::Hourly] {
        let from = floor_to(summary_type, first_capture)?;
        let mut produced = 0;
        for window in closed_windows_between(summary_type, from, now)? {
            if engine
                .summarize_if_observed(summary_type, window)
                .await?
                .is_some()
            {
                produced += 1;
            }
        }
        info!("{} {} summaries in place", produced, summary_type.as_str());
        match summary_type {
            SummaryType::FiveMinute => report.five_minute = produced,
            SummaryType::Hourly => report.hourly = produced,
            SummaryType::Daily => {}
        }
    }

    Ok(report)
}

pub async fn run_backfill(settings: &Settings) -> Result<()> {
    let db = Database::new(settings.database_path.clone())?;
    let clock = SystemClock;
    let engine = AggregationEngine::new(db.clone(), Arc::new(clock));
    let report = backfill(&db, &engine, &clock).await?;
    println!(
        "Backfill complete: {} five-minute and {} hourly summaries",
        report.five_minute, report.hourly
    );
    Ok(())
}

pub async fn run_stats(settings: &Settings) -> Result<()> {
    let db = Database::new(settings.database_path.clone())?;
    print_stats(&db).await
}

async fn print_stats(db: &Database) -> Result<()> {
    let stats = db.get_capture_stats().await?;
    let labels = LabelRegistry::new(db.clone(), Arc::new(SystemClock))
        .labels_with_usage()
        .await?;
    let five_minute = db.count_summaries(SummaryType::FiveMinute).await?;
    let hourly = db.count_summaries(SummaryType::Hourly).await?;

    println!("Captures:     {}", stats.total_captures);
    println!("  classified: {}", stats.classified);
    println!("  failed:     {}", stats.failed);
    println!("  pending:    {}", stats.pending);
    if let (Some(first), Some(last)) = (stats.first_capture, stats.last_capture) {
        println!("  span:       {} .. {}", first.to_rfc3339(), last.to_rfc3339());
    }
    println!("  snapshots:  {:.1} MB", stats.total_snapshot_mb());
    println!("Summaries:    {five_minute} five-minute, {hourly} hourly");

    if labels.is_empty() {
        println!("Labels:       none");
    } else {
        println!("Labels:");
        for usage in labels {
            println!("  {:<30} {}", usage.label.name, usage.capture_count);
        }
    }
    Ok(())
}
