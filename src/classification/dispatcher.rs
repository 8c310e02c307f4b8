use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::db::{is_fatal_storage_error, Database, SummaryType};

use super::{
    client::{ClassificationError, ClassificationRequest, Classifier},
    prompts::classification_prompt,
    reconciler::{ClassificationOutcome, ReconcileStatus, Reconciler},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const SHUTDOWN_ABORT_REASON: &str = "classification aborted at shutdown";
pub const RESTART_ABORT_REASON: &str = "classification interrupted by restart";

/// How many recently used labels are offered to the classifier.
const PROMPT_LABEL_LIMIT: usize = 50;

const RECONCILE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Sends captures off for classification without blocking the caller.
///
/// Each capture gets its own task that asks the classifier, bounded by
/// `timeout`, and hands the outcome to the `Reconciler`. Tasks are tracked by
/// capture id so shutdown can wait for them and fail whatever is left.
#[derive(Clone)]
pub struct ClassificationDispatcher {
    classifier: Arc<dyn Classifier>,
    reconciler: Reconciler,
    db: Database,
    timeout: Duration,
    in_flight: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
    storage_failed: CancellationToken,
}

impl ClassificationDispatcher {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        reconciler: Reconciler,
        db: Database,
        timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            reconciler,
            db,
            timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            storage_failed: CancellationToken::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Resolves once a classification result could not be stored because
    /// storage is unusable.
    pub async fn storage_failed(&self) {
        self.storage_failed.cancelled().await
    }

    /// Token cancelled on a fatal storage error. The scheduler shares it
    /// with its cadences.
    pub(crate) fn failure_token(&self) -> CancellationToken {
        self.storage_failed.clone()
    }

    /// Starts classification of `capture_id` in the background and returns
    /// immediately.
    pub fn dispatch(&self, capture_id: i64, image: Arc<Vec<u8>>) {
        let worker = self.clone();

        if self.closed.load(Ordering::SeqCst) {
            log_warn!("dispatcher is shut down; failing capture {capture_id} without classifying");
            tokio::spawn(async move {
                worker
                    .reconcile(capture_id, ClassificationOutcome::failed(SHUTDOWN_ABORT_REASON))
                    .await;
            });
            return;
        }

        // Hold the map while spawning so the task cannot deregister itself
        // before it has been registered.
        let mut in_flight = lock(&self.in_flight);
        let handle = tokio::spawn(async move {
            let outcome = worker.classify(capture_id, image).await;
            worker.reconcile(capture_id, outcome).await;
            lock(&worker.in_flight).remove(&capture_id);
        });
        in_flight.insert(capture_id, handle);
    }

    async fn classify(&self, capture_id: i64, image: Arc<Vec<u8>>) -> ClassificationOutcome {
        let prompt = self.build_prompt().await;
        let request = ClassificationRequest {
            capture_id,
            image,
            prompt,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.classifier.classify(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(ClassificationError::Timeout(self.timeout)),
        };

        match result {
            Ok(classification) => {
                log_debug!(
                    "capture {capture_id} classified in {}ms",
                    started.elapsed().as_millis()
                );
                ClassificationOutcome::Classified(classification)
            }
            Err(err) => {
                log_warn!("classification failed for capture {capture_id}: {err}");
                ClassificationOutcome::failed(err.to_string())
            }
        }
    }

    /// Prompt context is best effort; a failed lookup only makes the prompt
    /// less specific.
    async fn build_prompt(&self) -> String {
        let labels = match self.db.get_recent_label_names(PROMPT_LABEL_LIMIT).await {
            Ok(labels) => labels,
            Err(err) => {
                log_warn!("failed to load labels for prompt: {err:#}");
                Vec::new()
            }
        };
        let last_summary = match self.db.get_latest_summary(SummaryType::FiveMinute).await {
            Ok(summary) => summary.map(|summary| summary.content.narrative().to_string()),
            Err(err) => {
                log_warn!("failed to load latest summary for prompt: {err:#}");
                None
            }
        };
        classification_prompt(&labels, last_summary.as_deref())
    }

    /// Stores `outcome`, retrying once. A classification that still cannot
    /// be stored is recorded as a failure so the capture does not stay
    /// pending.
    async fn reconcile(&self, capture_id: i64, outcome: ClassificationOutcome) {
        let mut result = self.reconciler.apply(capture_id, outcome.clone()).await;
        if let Err(err) = &result {
            if !is_fatal_storage_error(err) {
                log_warn!("storing result for capture {capture_id} failed, retrying: {err:#}");
                tokio::time::sleep(RECONCILE_RETRY_DELAY).await;
                result = self.reconciler.apply(capture_id, outcome.clone()).await;
            }
        }
        if let Err(err) = &result {
            if matches!(outcome, ClassificationOutcome::Classified(_)) && !is_fatal_storage_error(err) {
                let reason = format!("classification result could not be stored: {err}");
                result = self
                    .reconciler
                    .apply(capture_id, ClassificationOutcome::failed(reason))
                    .await;
            }
        }

        match result {
            Ok(ReconcileStatus::Applied) => {}
            Ok(ReconcileStatus::AlreadyReconciled) => {
                log_info!("capture {capture_id} already reconciled; late result ignored");
            }
            Ok(ReconcileStatus::UnknownCapture) => {
                log_warn!("classification result for unknown capture {capture_id} ignored");
            }
            Err(err) if is_fatal_storage_error(&err) => {
                log::error!("cannot store result for capture {capture_id}, storage is unusable: {err:#}");
                self.storage_failed.cancel();
            }
            Err(err) => {
                log_error!("failed to reconcile capture {capture_id}: {err:#}");
            }
        }
    }

    /// Stops accepting work, waits up to `grace` for in-flight
    /// classifications, then aborts the rest and marks their captures failed.
    /// Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> Result<usize> {
        self.closed.store(true, Ordering::SeqCst);

        let handles: Vec<(i64, JoinHandle<()>)> = lock(&self.in_flight).drain().collect();
        if handles.is_empty() {
            return Ok(0);
        }
        log_info!(
            "waiting up to {}s for {} in-flight classifications",
            grace.as_secs_f32(),
            handles.len()
        );

        let deadline = Instant::now() + grace;
        let mut aborted = Vec::new();
        for (capture_id, mut handle) in handles {
            if handle.is_finished() {
                continue;
            }
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                aborted.push(capture_id);
            }
        }

        for capture_id in &aborted {
            let status = self
                .reconciler
                .apply(*capture_id, ClassificationOutcome::failed(SHUTDOWN_ABORT_REASON))
                .await?;
            if status == ReconcileStatus::Applied {
                log_warn!("capture {capture_id}: {SHUTDOWN_ABORT_REASON}");
            }
        }

        Ok(aborted.len())
    }
}

/// Marks every capture still pending from an earlier process as failed. Their
/// classification tasks died with that process.
pub async fn fail_orphaned_captures(db: &Database, reconciler: &Reconciler) -> Result<usize> {
    let mut failed = 0;
    for capture_id in db.get_pending_capture_ids().await? {
        let status = reconciler
            .apply(capture_id, ClassificationOutcome::failed(RESTART_ABORT_REASON))
            .await?;
        if status == ReconcileStatus::Applied {
            failed += 1;
        }
    }
    if failed > 0 {
        log::warn!("marked {failed} orphaned pending captures as failed");
    }
    Ok(failed)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::client::Classification;
    use crate::clock::SystemClock;
    use crate::db::ClassificationState;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Scripted {
        delay: Duration,
        result: fn() -> Result<Classification, ClassificationError>,
    }

    #[async_trait]
    impl Classifier for Scripted {
        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<Classification, ClassificationError> {
            tokio::time::sleep(self.delay).await;
            (self.result)()
        }
    }

    fn coding() -> Result<Classification, ClassificationError> {
        Ok(Classification {
            description: "Editing code".into(),
            labels: vec!["Coding".into()],
            raw: None,
        })
    }

    fn refused() -> Result<Classification, ClassificationError> {
        Err(ClassificationError::Refused("no".into()))
    }

    fn setup(
        delay: Duration,
        result: fn() -> Result<Classification, ClassificationError>,
        timeout: Duration,
    ) -> (tempfile::TempDir, Database, ClassificationDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("dispatch.sqlite3")).unwrap();
        let reconciler = Reconciler::new(db.clone(), Arc::new(SystemClock));
        let dispatcher = ClassificationDispatcher::new(
            Arc::new(Scripted { delay, result }),
            reconciler,
            db.clone(),
            timeout,
        );
        (dir, db, dispatcher)
    }

    async fn wait_until_resolved(db: &Database, capture_id: i64) -> crate::db::Capture {
        for _ in 0..200 {
            let capture = db.get_capture(capture_id, false).await.unwrap().unwrap();
            if capture.state() != ClassificationState::Pending {
                return capture;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture {capture_id} never resolved");
    }

    #[tokio::test]
    async fn successful_classification_is_reconciled() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_millis(5), coding, Duration::from_secs(5));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();

        dispatcher.dispatch(id, Arc::new(vec![1]));
        let capture = wait_until_resolved(&db, id).await;

        assert_eq!(capture.state(), ClassificationState::Classified);
        assert_eq!(capture.labels, vec!["coding"]);
    }

    #[tokio::test]
    async fn classifier_error_marks_capture_failed() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_millis(1), refused, Duration::from_secs(5));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();

        dispatcher.dispatch(id, Arc::new(vec![1]));
        let capture = wait_until_resolved(&db, id).await;

        assert_eq!(capture.state(), ClassificationState::Failed);
        assert!(capture
            .classification_error
            .unwrap()
            .contains("refused"));
    }

    #[tokio::test]
    async fn timeout_marks_capture_failed() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_secs(30), coding, Duration::from_millis(50));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();

        dispatcher.dispatch(id, Arc::new(vec![1]));
        let capture = wait_until_resolved(&db, id).await;

        assert_eq!(capture.state(), ClassificationState::Failed);
        assert!(capture.classification_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_secs(30), coding, Duration::from_secs(60));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();

        dispatcher.dispatch(id, Arc::new(vec![1]));
        assert_eq!(dispatcher.in_flight(), 1);

        let aborted = dispatcher
            .shutdown(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(aborted, 1);
        assert_eq!(dispatcher.in_flight(), 0);

        let capture = db.get_capture(id, false).await.unwrap().unwrap();
        assert_eq!(
            capture.classification_error.as_deref(),
            Some(SHUTDOWN_ABORT_REASON)
        );
    }

    #[tokio::test]
    async fn unstorable_classification_is_recorded_as_failure() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_millis(1), coding, Duration::from_secs(5));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();
        db.execute(|conn| {
            conn.execute_batch("DROP TABLE capture_labels")?;
            Ok(())
        })
        .await
        .unwrap();

        dispatcher.dispatch(id, Arc::new(vec![1]));
        let capture = wait_until_resolved(&db, id).await;

        assert_eq!(capture.state(), ClassificationState::Failed);
        assert!(capture
            .classification_error
            .unwrap()
            .contains("could not be stored"));
    }

    #[tokio::test]
    async fn lost_storage_is_escalated() {
        let (_dir, db, dispatcher) =
            setup(Duration::from_millis(1), coding, Duration::from_secs(5));
        let id = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();

        // Take the database worker down.
        let crashed = db
            .execute(|_conn| -> Result<()> { panic!("database worker crashed") })
            .await;
        assert!(crashed.is_err());

        dispatcher.dispatch(id, Arc::new(vec![1]));
        tokio::time::timeout(Duration::from_secs(2), dispatcher.storage_failed())
            .await
            .expect("fatal storage error was not escalated");
    }

    #[tokio::test]
    async fn orphaned_pending_captures_fail_on_recovery() {
        let (_dir, db, _dispatcher) =
            setup(Duration::from_millis(1), coding, Duration::from_secs(5));
        let reconciler = Reconciler::new(db.clone(), Arc::new(SystemClock));
        let first = db.insert_pending_capture(Utc::now(), vec![1]).await.unwrap();
        let second = db.insert_pending_capture(Utc::now(), vec![2]).await.unwrap();
        reconciler
            .apply(second, ClassificationOutcome::failed("earlier failure"))
            .await
            .unwrap();

        let failed = fail_orphaned_captures(&db, &reconciler).await.unwrap();
        assert_eq!(failed, 1);

        let capture = db.get_capture(first, false).await.unwrap().unwrap();
        assert_eq!(
            capture.classification_error.as_deref(),
            Some(RESTART_ABORT_REASON)
        );
        assert!(db.get_pending_capture_ids().await.unwrap().is_empty());
    }
}
