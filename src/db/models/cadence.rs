use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SummaryType;

/// Persisted progress of one rollup cadence: every window ending at or before
/// `last_window_end` has been handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CadenceMarker {
    pub summary_type: SummaryType,
    pub last_window_end: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
