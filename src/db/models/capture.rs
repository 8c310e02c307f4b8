//! Capture data model.
//!
//! One row per snapshot attempt that produced an image. The classification
//! fields start empty and are filled in exactly once by reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationState {
    Pending,
    Classified,
    Failed,
}

impl ClassificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationState::Pending => "pending",
            ClassificationState::Classified => "classified",
            ClassificationState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// Only populated by queries that ask for the snapshot bytes.
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    pub screenshot_bytes: u64,
    pub description: Option<String>,
    pub classification_raw: Option<String>,
    pub classification_error: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Label names linked to this capture, sorted.
    pub labels: Vec<String>,
}

impl Capture {
    pub fn state(&self) -> ClassificationState {
        if self.classification_error.is_some() {
            ClassificationState::Failed
        } else if self.description.is_some() {
            ClassificationState::Classified
        } else {
            ClassificationState::Pending
        }
    }
}

/// Aggregate figures over the whole capture table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub total_captures: u64,
    pub classified: u64,
    pub failed: u64,
    pub pending: u64,
    pub first_capture: Option<DateTime<Utc>>,
    pub last_capture: Option<DateTime<Utc>>,
    pub total_snapshot_bytes: u64,
}

impl CaptureStats {
    pub fn total_snapshot_mb(&self) -> f64 {
        self.total_snapshot_bytes as f64 / 1024.0 / 1024.0
    }
}
