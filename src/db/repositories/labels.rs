use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    helpers::{conversion_error, format_datetime, parse_datetime, to_u64},
    models::{Label, LabelUsage},
    Database,
};

fn row_to_label(row: &Row) -> Result<Label, rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    let last_used: String = row.get("last_used")?;

    Ok(Label {
        id: row.get("id")?,
        name: row.get("name")?,
        created_at: parse_datetime(&created_at, "created_at").map_err(conversion_error)?,
        last_used: parse_datetime(&last_used, "last_used").map_err(conversion_error)?,
    })
}

pub struct LabelRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LabelRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert the label, or touch `last_used` when the name already exists.
    /// `name` must already be normalized.
    pub fn upsert(&self, name: &str, used_at: DateTime<Utc>) -> Result<Label> {
        let used_at = format_datetime(&used_at);
        self.conn.execute(
            "INSERT INTO labels (name, created_at, last_used)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(name) DO UPDATE SET
                 last_used = excluded.last_used",
            params![name, used_at],
        )?;

        self.conn
            .query_row(
                "SELECT id, name, created_at, last_used FROM labels WHERE name = ?1",
                params![name],
                row_to_label,
            )
            .map_err(|err| anyhow!("label {name} not found after upsert: {err}"))
    }

    /// Names ordered by most recent use.
    pub fn recent_names(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM labels
             ORDER BY last_used DESC, name ASC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let names = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn with_usage(&self) -> Result<Vec<LabelUsage>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.id, l.name, l.created_at, l.last_used, COUNT(cl.capture_id) AS capture_count
             FROM labels l
             LEFT JOIN captures_labels cl ON cl.label_id = l.id
             GROUP BY l.id
             ORDER BY l.last_used DESC, l.name ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut usage = Vec::new();
        while let Some(row) = rows.next()? {
            let count: i64 = row.get("capture_count")?;
            usage.push(LabelUsage {
                label: row_to_label(row)?,
                capture_count: to_u64(count, "capture_count")?,
            });
        }
        Ok(usage)
    }
}

impl Database {
    pub async fn upsert_label(&self, name: String, used_at: DateTime<Utc>) -> Result<Label> {
        self.execute(move |conn| LabelRepository::new(conn).upsert(&name, used_at))
            .await
    }

    pub async fn get_recent_label_names(&self, limit: usize) -> Result<Vec<String>> {
        self.execute(move |conn| LabelRepository::new(conn).recent_names(limit))
            .await
    }

    pub async fn get_labels_with_usage(&self) -> Result<Vec<LabelUsage>> {
        self.execute(|conn| LabelRepository::new(conn).with_usage())
            .await
    }
}
