//! Applies classification outcomes to their captures.
//!
//! Outcomes arrive asynchronously and in any order; each one names its
//! capture by id. A capture accepts exactly one outcome: the first one wins
//! through a compare-and-set, and anything later is reported back as
//! `AlreadyReconciled` without touching the row.

use std::sync::Arc;

use anyhow::Result;

use crate::clock::Clock;
use crate::db::{
    repositories::{CaptureRepository, LabelRepository},
    Database,
};
use crate::labels::dedup_label_names;

use super::client::Classification;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Classified(Classification),
    Failed { reason: String },
}

impl ClassificationOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ClassificationOutcome::Failed {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    Applied,
    /// The capture already carries an outcome; nothing changed.
    AlreadyReconciled,
    /// No capture with that id exists; nothing changed.
    UnknownCapture,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn apply(
        &self,
        capture_id: i64,
        outcome: ClassificationOutcome,
    ) -> Result<ReconcileStatus> {
        let now = self.clock.now();

        self.db
            .transaction(move |tx| {
                let captures = CaptureRepository::new(tx);

                let applied = match &outcome {
                    ClassificationOutcome::Classified(classification) => {
                        let applied = captures.mark_classified(
                            capture_id,
                            &classification.description,
                            classification.raw.as_deref(),
                            now,
                        )?;
                        if applied {
                            let labels = LabelRepository::new(tx);
                            for name in dedup_label_names(&classification.labels) {
                                let label = labels.upsert(&name, now)?;
                                captures.link_label(capture_id, label.id)?;
                            }
                        }
                        applied
                    }
                    ClassificationOutcome::Failed { reason } => {
                        captures.mark_failed(capture_id, reason, now)?
                    }
                };

                if applied {
                    Ok(ReconcileStatus::Applied)
                } else if captures.exists(capture_id)? {
                    Ok(ReconcileStatus::AlreadyReconciled)
                } else {
                    Ok(ReconcileStatus::UnknownCapture)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::db::ClassificationState;
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        clock: MockClock,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("reconcile.sqlite3")).unwrap();
        let clock = MockClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap());
        let reconciler = Reconciler::new(db.clone(), Arc::new(clock.clone()));
        Fixture {
            _dir: dir,
            db,
            clock,
            reconciler,
        }
    }

    fn classified(description: &str, labels: &[&str]) -> ClassificationOutcome {
        ClassificationOutcome::Classified(Classification {
            description: description.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            raw: Some("{\"raw\":true}".to_string()),
        })
    }

    #[tokio::test]
    async fn success_links_deduplicated_labels() {
        let f = fixture();
        let id = f
            .db
            .insert_pending_capture(f.clock.now(), vec![7; 16])
            .await
            .unwrap();

        let status = f
            .reconciler
            .apply(id, classified("Writing tests", &["Coding", "coding", " terminal "]))
            .await
            .unwrap();
        assert_eq!(status, ReconcileStatus::Applied);

        let capture = f.db.get_capture(id, false).await.unwrap().unwrap();
        assert_eq!(capture.state(), ClassificationState::Classified);
        assert_eq!(capture.description.as_deref(), Some("Writing tests"));
        assert_eq!(capture.classification_raw.as_deref(), Some("{\"raw\":true}"));
        assert!(capture.classification_error.is_none());
        assert_eq!(capture.labels, vec!["coding", "terminal"]);
        assert_eq!(capture.reconciled_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn zero_labels_records_description_only() {
        let f = fixture();
        let id = f
            .db
            .insert_pending_capture(f.clock.now(), vec![1])
            .await
            .unwrap();

        f.reconciler
            .apply(id, classified("Idle desktop", &[]))
            .await
            .unwrap();

        let capture = f.db.get_capture(id, false).await.unwrap().unwrap();
        assert_eq!(capture.description.as_deref(), Some("Idle desktop"));
        assert!(capture.labels.is_empty());
        assert!(f.db.get_labels_with_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_capture_visible() {
        let f = fixture();
        let id = f
            .db
            .insert_pending_capture(f.clock.now(), vec![1, 2])
            .await
            .unwrap();

        let status = f
            .reconciler
            .apply(id, ClassificationOutcome::failed("service unavailable"))
            .await
            .unwrap();
        assert_eq!(status, ReconcileStatus::Applied);

        let capture = f.db.get_capture(id, true).await.unwrap().unwrap();
        assert_eq!(capture.state(), ClassificationState::Failed);
        assert!(capture.description.is_none());
        assert_eq!(capture.screenshot.as_deref(), Some(&[1u8, 2][..]));
    }

    #[tokio::test]
    async fn late_result_is_a_no_op() {
        let f = fixture();
        let id = f
            .db
            .insert_pending_capture(f.clock.now(), vec![1])
            .await
            .unwrap();

        f.reconciler
            .apply(id, classified("Reading email", &["email"]))
            .await
            .unwrap();
        f.clock.advance(Duration::seconds(30));

        let late = f
            .reconciler
            .apply(id, classified("Something else", &["gaming"]))
            .await
            .unwrap();
        assert_eq!(late, ReconcileStatus::AlreadyReconciled);

        let failed_late = f
            .reconciler
            .apply(id, ClassificationOutcome::failed("timed out"))
            .await
            .unwrap();
        assert_eq!(failed_late, ReconcileStatus::AlreadyReconciled);

        let capture = f.db.get_capture(id, false).await.unwrap().unwrap();
        assert_eq!(capture.description.as_deref(), Some("Reading email"));
        assert!(capture.classification_error.is_none());
        assert_eq!(capture.labels, vec!["email"]);

        let labels = f.db.get_labels_with_usage().await.unwrap();
        assert_eq!(labels.len(), 1, "late result must not create labels");
    }

    #[tokio::test]
    async fn unknown_capture_is_a_no_op() {
        let f = fixture();
        let status = f
            .reconciler
            .apply(4242, classified("Nothing", &["ghost"]))
            .await
            .unwrap();
        assert_eq!(status, ReconcileStatus::UnknownCapture);
        assert!(f.db.get_labels_with_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn description_and_error_are_never_both_set() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(
                f.db
                    .insert_pending_capture(f.clock.now() + Duration::seconds(i), vec![0])
                    .await
                    .unwrap(),
            );
        }

        // Interleave competing outcomes in both orders.
        for (i, id) in ids.iter().enumerate() {
            let (first, second) = if i % 2 == 0 {
                (classified("work", &["coding"]), ClassificationOutcome::failed("x"))
            } else {
                (ClassificationOutcome::failed("x"), classified("work", &["coding"]))
            };
            f.reconciler.apply(*id, first).await.unwrap();
            f.reconciler.apply(*id, second).await.unwrap();
        }

        for id in ids {
            let capture = f.db.get_capture(id, false).await.unwrap().unwrap();
            assert!(
                !(capture.description.is_some() && capture.classification_error.is_some()),
                "capture {id} has both description and error"
            );
        }
    }
}
