use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::{
    helpers::{format_datetime, parse_datetime},
    models::{CadenceMarker, SummaryType},
    Database,
};

impl Database {
    pub async fn load_cadence_marker(
        &self,
        summary_type: SummaryType,
    ) -> Result<Option<CadenceMarker>> {
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT last_window_end, updated_at FROM cadence_state WHERE cadence = ?1",
                    params![summary_type.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            match row {
                Some((last_window_end, updated_at)) => Ok(Some(CadenceMarker {
                    summary_type,
                    last_window_end: parse_datetime(&last_window_end, "last_window_end")?,
                    updated_at: parse_datetime(&updated_at, "updated_at")?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    /// Moves the cursor forward. A stale write (older than what is stored) is ignored.
    pub async fn store_cadence_marker(
        &self,
        summary_type: SummaryType,
        last_window_end: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO cadence_state (cadence, last_window_end, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(cadence) DO UPDATE SET
                     last_window_end = excluded.last_window_end,
                     updated_at = excluded.updated_at
                 WHERE excluded.last_window_end > cadence_state.last_window_end",
                params![
                    summary_type.as_str(),
                    format_datetime(&last_window_end),
                    format_datetime(&updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }
}
