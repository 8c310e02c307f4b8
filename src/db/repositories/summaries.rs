use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    helpers::{conversion_error, format_datetime, parse_datetime, parse_summary_type},
    models::{Summary, SummaryContent, SummaryType},
    Database,
};

fn row_to_summary(row: &Row) -> Result<Summary, rusqlite::Error> {
    let summary_type: String = row.get("summary_type")?;
    let window_start: String = row.get("window_start")?;
    let window_end: String = row.get("window_end")?;
    let content: String = row.get("content")?;
    let created_at: String = row.get("created_at")?;

    let content: SummaryContent = serde_json::from_str(&content)
        .map_err(|err| conversion_error(anyhow!("invalid summary content: {err}")))?;

    Ok(Summary {
        id: row.get("id")?,
        summary_type: parse_summary_type(&summary_type).map_err(conversion_error)?,
        window_start: parse_datetime(&window_start, "window_start").map_err(conversion_error)?,
        window_end: parse_datetime(&window_end, "window_end").map_err(conversion_error)?,
        content,
        created_at: parse_datetime(&created_at, "created_at").map_err(conversion_error)?,
    })
}

const SUMMARY_COLUMNS: &str = "id, summary_type, window_start, window_end, content, created_at";

pub struct SummaryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SummaryRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find(
        &self,
        summary_type: SummaryType,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Summary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries WHERE summary_type = ?1 AND window_start = ?2"
        );
        let summary = self
            .conn
            .query_row(
                &sql,
                params![summary_type.as_str(), format_datetime(&window_start)],
                row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Insert unless a row for (type, window_start) already exists, then
    /// return whichever row is stored. An existing row is never overwritten.
    pub fn insert_if_absent(
        &self,
        summary_type: SummaryType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        content: &SummaryContent,
        created_at: DateTime<Utc>,
    ) -> Result<Summary> {
        let content_json =
            serde_json::to_string(content).context("failed to serialize summary content")?;

        self.conn
            .execute(
                "INSERT INTO summaries (summary_type, window_start, window_end, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(summary_type, window_start) DO NOTHING",
                params![
                    summary_type.as_str(),
                    format_datetime(&window_start),
                    format_datetime(&window_end),
                    content_json,
                    format_datetime(&created_at),
                ],
            )
            .context("failed to insert summary")?;

        self.find(summary_type, window_start)?
            .ok_or_else(|| anyhow!("summary missing after insert"))
    }

    /// Summaries whose window lies entirely inside [start, end), oldest first.
    pub fn in_range(
        &self,
        summary_type: SummaryType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Summary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE summary_type = ?1 AND window_start >= ?2 AND window_end <= ?3
             ORDER BY window_start ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let summaries = stmt
            .query_map(
                params![
                    summary_type.as_str(),
                    format_datetime(&start),
                    format_datetime(&end)
                ],
                row_to_summary,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    pub fn latest(&self, summary_type: SummaryType) -> Result<Option<Summary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE summary_type = ?1
             ORDER BY window_start DESC
             LIMIT 1"
        );
        let summary = self
            .conn
            .query_row(&sql, params![summary_type.as_str()], row_to_summary)
            .optional()?;
        Ok(summary)
    }

    pub fn count(&self, summary_type: SummaryType) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM summaries WHERE summary_type = ?1",
            params![summary_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl Database {
    pub async fn get_summaries_in_range(
        &self,
        summary_type: SummaryType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Summary>> {
        self.execute(move |conn| SummaryRepository::new(conn).in_range(summary_type, start, end))
            .await
    }

    pub async fn get_latest_summary(&self, summary_type: SummaryType) -> Result<Option<Summary>> {
        self.execute(move |conn| SummaryRepository::new(conn).latest(summary_type))
            .await
    }

    pub async fn count_summaries(&self, summary_type: SummaryType) -> Result<u64> {
        self.execute(move |conn| SummaryRepository::new(conn).count(summary_type))
            .await
    }
}
