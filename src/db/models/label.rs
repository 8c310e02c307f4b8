use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named activity category. Names are normalized before storage and never
/// change once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelUsage {
    pub label: Label,
    pub capture_count: u64,
}
