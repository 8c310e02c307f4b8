use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    helpers::{conversion_error, format_datetime, parse_datetime, parse_optional_datetime, to_u64},
    models::{Capture, CaptureStats},
    Database,
};

const CAPTURE_COLUMNS: &str = "id, timestamp, LENGTH(screenshot) AS screenshot_bytes, description,
     classification_raw, classification_error, reconciled_at, created_at";

fn row_to_capture(row: &Row, include_screenshot: bool) -> Result<Capture, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    let reconciled_at: Option<String> = row.get("reconciled_at")?;
    let created_at: String = row.get("created_at")?;
    let screenshot_bytes: i64 = row.get("screenshot_bytes")?;

    Ok(Capture {
        id: row.get("id")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(conversion_error)?,
        screenshot: if include_screenshot {
            Some(row.get("screenshot")?)
        } else {
            None
        },
        screenshot_bytes: to_u64(screenshot_bytes, "screenshot_bytes").map_err(conversion_error)?,
        description: row.get("description")?,
        classification_raw: row.get("classification_raw")?,
        classification_error: row.get("classification_error")?,
        reconciled_at: parse_optional_datetime(reconciled_at, "reconciled_at")
            .map_err(conversion_error)?,
        created_at: parse_datetime(&created_at, "created_at").map_err(conversion_error)?,
        labels: Vec::new(),
    })
}

fn select_clause(include_screenshot: bool) -> String {
    if include_screenshot {
        format!("SELECT {CAPTURE_COLUMNS}, screenshot FROM captures")
    } else {
        format!("SELECT {CAPTURE_COLUMNS} FROM captures")
    }
}

/// Synchronous capture queries over a borrowed connection or transaction.
pub struct CaptureRepository<'a> {
    conn: &'a Connection,
}

impl<'a> CaptureRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Appends a pending capture (no description, no error) and returns its id.
    pub fn insert_pending(
        &self,
        timestamp: DateTime<Utc>,
        screenshot: &[u8],
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO captures (timestamp, screenshot, created_at) VALUES (?1, ?2, ?3)",
                params![
                    format_datetime(&timestamp),
                    screenshot,
                    format_datetime(&created_at)
                ],
            )
            .context("failed to insert capture")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn exists(&self, capture_id: i64) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM captures WHERE id = ?1",
                params![capture_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Compare-and-set from pending to classified. Returns false when the
    /// capture is missing or already reconciled.
    pub fn mark_classified(
        &self,
        capture_id: i64,
        description: &str,
        raw: Option<&str>,
        reconciled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE captures
             SET description = ?1,
                 classification_raw = ?2,
                 reconciled_at = ?3
             WHERE id = ?4
               AND description IS NULL
               AND classification_error IS NULL",
            params![description, raw, format_datetime(&reconciled_at), capture_id],
        )?;
        Ok(updated == 1)
    }

    /// Compare-and-set from pending to failed.
    pub fn mark_failed(
        &self,
        capture_id: i64,
        reason: &str,
        reconciled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE captures
             SET classification_error = ?1,
                 reconciled_at = ?2
             WHERE id = ?3
               AND description IS NULL
               AND classification_error IS NULL",
            params![reason, format_datetime(&reconciled_at), capture_id],
        )?;
        Ok(updated == 1)
    }

    pub fn link_label(&self, capture_id: i64, label_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO captures_labels (capture_id, label_id) VALUES (?1, ?2)",
            params![capture_id, label_id],
        )?;
        Ok(())
    }

    pub fn labels_for(&self, capture_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.name
             FROM labels l
             JOIN captures_labels cl ON l.id = cl.label_id
             WHERE cl.capture_id = ?1
             ORDER BY l.name ASC",
        )?;
        let names = stmt
            .query_map(params![capture_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn get(&self, capture_id: i64, include_screenshot: bool) -> Result<Option<Capture>> {
        let sql = format!("{} WHERE id = ?1", select_clause(include_screenshot));
        let capture = self
            .conn
            .query_row(&sql, params![capture_id], |row| {
                row_to_capture(row, include_screenshot)
            })
            .optional()?;

        match capture {
            Some(mut capture) => {
                capture.labels = self.labels_for(capture.id)?;
                Ok(Some(capture))
            }
            None => Ok(None),
        }
    }

    /// Captures with `start <= timestamp < end`, oldest first, labels attached.
    pub fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_screenshot: bool,
    ) -> Result<Vec<Capture>> {
        let start = format_datetime(&start);
        let end = format_datetime(&end);

        let sql = format!(
            "{} WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC, id ASC",
            select_clause(include_screenshot)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut captures = stmt
            .query_map(params![start, end], |row| {
                row_to_capture(row, include_screenshot)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut label_stmt = self.conn.prepare(
            "SELECT cl.capture_id, l.name
             FROM captures_labels cl
             JOIN labels l ON l.id = cl.label_id
             JOIN captures c ON c.id = cl.capture_id
             WHERE c.timestamp >= ?1 AND c.timestamp < ?2",
        )?;
        let mut labels_by_capture: HashMap<i64, Vec<String>> = HashMap::new();
        let mut rows = label_stmt.query(params![start, end])?;
        while let Some(row) = rows.next()? {
            let capture_id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            labels_by_capture.entry(capture_id).or_default().push(name);
        }

        for capture in &mut captures {
            if let Some(mut names) = labels_by_capture.remove(&capture.id) {
                names.sort();
                capture.labels = names;
            }
        }

        Ok(captures)
    }

    pub fn count_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM captures WHERE timestamp >= ?1 AND timestamp < ?2",
            params![format_datetime(&start), format_datetime(&end)],
            |row| row.get(0),
        )?;
        to_u64(count, "capture count")
    }

    pub fn pending_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM captures
             WHERE description IS NULL AND classification_error IS NULL
             ORDER BY timestamp ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> Result<CaptureStats> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN classification_error IS NOT NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN classification_error IS NULL AND description IS NOT NULL THEN 1 ELSE 0 END), 0),
                    MIN(timestamp),
                    MAX(timestamp),
                    COALESCE(SUM(LENGTH(screenshot)), 0)
                 FROM captures",
                [],
                |row| {
                    let total: i64 = row.get(0)?;
                    let failed: i64 = row.get(1)?;
                    let classified: i64 = row.get(2)?;
                    let first: Option<String> = row.get(3)?;
                    let last: Option<String> = row.get(4)?;
                    let bytes: i64 = row.get(5)?;
                    Ok((total, failed, classified, first, last, bytes))
                },
            )
            .map_err(anyhow::Error::from)
            .and_then(|(total, failed, classified, first, last, bytes)| {
                let total = to_u64(total, "total_captures")?;
                let failed = to_u64(failed, "failed")?;
                let classified = to_u64(classified, "classified")?;
                Ok(CaptureStats {
                    total_captures: total,
                    classified,
                    failed,
                    pending: total.saturating_sub(failed + classified),
                    first_capture: parse_optional_datetime(first, "first_capture")?,
                    last_capture: parse_optional_datetime(last, "last_capture")?,
                    total_snapshot_bytes: to_u64(bytes, "total_snapshot_bytes")?,
                })
            })
    }
}

impl Database {
    pub async fn insert_pending_capture(
        &self,
        timestamp: DateTime<Utc>,
        screenshot: Vec<u8>,
    ) -> Result<i64> {
        self.execute(move |conn| {
            CaptureRepository::new(conn).insert_pending(timestamp, &screenshot, Utc::now())
        })
        .await
    }

    pub async fn get_capture(
        &self,
        capture_id: i64,
        include_screenshot: bool,
    ) -> Result<Option<Capture>> {
        self.execute(move |conn| CaptureRepository::new(conn).get(capture_id, include_screenshot))
            .await
    }

    pub async fn get_captures_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_screenshots: bool,
    ) -> Result<Vec<Capture>> {
        self.execute(move |conn| {
            CaptureRepository::new(conn).in_range(start, end, include_screenshots)
        })
        .await
    }

    pub async fn get_pending_capture_ids(&self) -> Result<Vec<i64>> {
        self.execute(|conn| CaptureRepository::new(conn).pending_ids())
            .await
    }

    pub async fn get_capture_stats(&self) -> Result<CaptureStats> {
        self.execute(|conn| CaptureRepository::new(conn).stats())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("captures.sqlite3")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn pending_capture_is_durable_and_unclassified() {
        let (_dir, db) = open();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 15).unwrap();

        let id = db.insert_pending_capture(at, vec![1, 2, 3, 4]).await.unwrap();
        let capture = db.get_capture(id, true).await.unwrap().unwrap();

        assert_eq!(capture.timestamp, at);
        assert_eq!(capture.screenshot.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(capture.screenshot_bytes, 4);
        assert_eq!(capture.state(), crate::db::ClassificationState::Pending);
        assert_eq!(db.get_pending_capture_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn classification_fields_transition_once() {
        let (_dir, db) = open();
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 15).unwrap();
        let id = db.insert_pending_capture(at, vec![0; 8]).await.unwrap();

        let (first, second) = db
            .execute(move |conn| {
                let repo = CaptureRepository::new(conn);
                let first = repo.mark_failed(id, "timeout", at)?;
                let second = repo.mark_classified(id, "editing code", None, at)?;
                Ok((first, second))
            })
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let capture = db.get_capture(id, false).await.unwrap().unwrap();
        assert_eq!(capture.classification_error.as_deref(), Some("timeout"));
        assert!(capture.description.is_none());
    }

    #[tokio::test]
    async fn range_is_half_open_and_ordered() {
        let (_dir, db) = open();
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(5);

        db.insert_pending_capture(end, vec![9]).await.unwrap();
        db.insert_pending_capture(start + chrono::Duration::seconds(30), vec![2])
            .await
            .unwrap();
        db.insert_pending_capture(start, vec![1]).await.unwrap();

        let captures = db.get_captures_in_range(start, end, false).await.unwrap();
        let times: Vec<_> = captures.iter().map(|c| c.timestamp).collect();
        assert_eq!(times, vec![start, start + chrono::Duration::seconds(30)]);

        let stats = db.get_capture_stats().await.unwrap();
        assert_eq!(stats.total_captures, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.first_capture, Some(start));
        assert_eq!(stats.last_capture, Some(end));
        assert_eq!(stats.total_snapshot_bytes, 3);
    }
}
