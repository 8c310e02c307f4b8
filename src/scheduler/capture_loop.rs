use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    capture::SnapshotSource,
    classification::ClassificationDispatcher,
    clock::Clock,
    db::{is_fatal_storage_error, Database},
};

use super::config::ScheduleConfig;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

pub(crate) struct CaptureContext {
    pub source: Arc<dyn SnapshotSource>,
    pub db: Database,
    pub dispatcher: ClassificationDispatcher,
    pub clock: Arc<dyn Clock>,
    pub config: ScheduleConfig,
}

/// Takes one snapshot per tick until cancelled. Only a fatal storage error
/// ends the loop early.
pub(crate) async fn capture_loop(ctx: CaptureContext, cancel_token: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(ctx.config.capture_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = capture_once(&ctx).await {
                    if is_fatal_storage_error(&err) {
                        log::error!("capture cadence stopping, storage is unusable: {err:#}");
                        return Err(err);
                    }
                    log_error!("capture tick failed: {err:#}");
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                return Ok(());
            }
        }
    }
}

/// One tick: acquire, persist as pending, hand off to classification. An
/// acquisition failure skips the tick without writing anything.
async fn capture_once(ctx: &CaptureContext) -> Result<()> {
    let started = Instant::now();
    let timestamp = ctx.clock.now();

    let bytes = match tokio::time::timeout(ctx.config.capture_timeout, ctx.source.capture()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            log_warn!("snapshot skipped: {err}");
            return Ok(());
        }
        Err(_) => {
            log_warn!(
                "snapshot skipped: acquisition exceeded {}s",
                ctx.config.capture_timeout.as_secs_f32()
            );
            return Ok(());
        }
    };

    let image = Arc::new(bytes);
    let capture_id = ctx
        .db
        .insert_pending_capture(timestamp, image.as_ref().clone())
        .await
        .context("failed to persist capture")?;

    ctx.dispatcher.dispatch(capture_id, image);

    log_info!(
        "capture {capture_id} stored in {}ms",
        started.elapsed().as_millis()
    );
    Ok(())
}
