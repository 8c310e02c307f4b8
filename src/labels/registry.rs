//! Label registry: maps activity names to stable label rows.
//!
//! Names are normalized before lookup: surrounding whitespace is trimmed,
//! inner whitespace runs collapse to one space, and the result is lowercased.
//! After that, matching is exact. A name that normalizes to nothing is not a
//! label.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::clock::Clock;
use crate::db::{models::LabelUsage, Database, Label};

pub fn normalize_label_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.to_lowercase())
    }
}

/// Normalizes every name and drops empties and duplicates, keeping the
/// order of first appearance.
pub fn dedup_label_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter_map(|name| normalize_label_name(name.as_ref()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

#[derive(Clone)]
pub struct LabelRegistry {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl LabelRegistry {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Returns the label for `name`, creating it on first use and touching
    /// `last_used` otherwise.
    pub async fn upsert(&self, name: &str) -> Result<Label> {
        let Some(normalized) = normalize_label_name(name) else {
            bail!("label name {name:?} is empty after normalization");
        };
        self.db.upsert_label(normalized, self.clock.now()).await
    }

    pub async fn labels_with_usage(&self) -> Result<Vec<LabelUsage>> {
        self.db.get_labels_with_usage().await
    }

    pub async fn recent_label_names(&self, limit: usize) -> Result<Vec<String>> {
        self.db.get_recent_label_names(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn normalization_trims_collapses_and_lowercases() {
        assert_eq!(
            normalize_label_name("  Reading   Documentation "),
            Some("reading documentation".to_string())
        );
        assert_eq!(normalize_label_name("coding"), Some("coding".to_string()));
        assert_eq!(normalize_label_name(" \t "), None);
    }

    #[test]
    fn dedup_keeps_first_appearance_order() {
        let names = dedup_label_names(["Coding", "meeting", "coding ", "", "Meeting"]);
        assert_eq!(names, vec!["coding".to_string(), "meeting".to_string()]);
    }

    #[tokio::test]
    async fn upsert_reuses_existing_label_and_touches_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("labels.sqlite3")).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let clock = MockClock::new(t0);
        let registry = LabelRegistry::new(db, Arc::new(clock.clone()));

        let created = registry.upsert("Coding").await.unwrap();
        assert_eq!(created.name, "coding");
        assert_eq!(created.created_at, t0);

        clock.advance(Duration::minutes(10));
        let touched = registry.upsert("  coding").await.unwrap();
        assert_eq!(touched.id, created.id);
        assert_eq!(touched.created_at, t0);
        assert_eq!(touched.last_used, t0 + Duration::minutes(10));

        let other = registry.upsert("browsing").await.unwrap();
        assert_ne!(other.id, created.id);

        assert!(registry.upsert("   ").await.is_err());

        let usage = registry.labels_with_usage().await.unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|entry| entry.capture_count == 0));
    }
}
