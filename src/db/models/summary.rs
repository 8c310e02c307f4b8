//! Summary data models.
//!
//! A summary covers one aligned window of one tier. Its content is stored as
//! JSON in the `content` column; `SummaryContent` is the tagged union of the
//! per-tier payloads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    FiveMinute,
    Hourly,
    /// Reserved. The schema accepts it but nothing produces it yet.
    Daily,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::FiveMinute => "five_minute",
            SummaryType::Hourly => "hourly",
            SummaryType::Daily => "daily",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "five_minute" => Some(SummaryType::FiveMinute),
            "hourly" => Some(SummaryType::Hourly),
            "daily" => Some(SummaryType::Daily),
            _ => None,
        }
    }

    /// Length of one window of this tier.
    pub fn span(&self) -> Duration {
        match self {
            SummaryType::FiveMinute => Duration::minutes(5),
            SummaryType::Hourly => Duration::hours(1),
            SummaryType::Daily => Duration::days(1),
        }
    }

    /// The tier this one is built from, if any.
    pub fn child(&self) -> Option<SummaryType> {
        match self {
            SummaryType::FiveMinute => None,
            SummaryType::Hourly => Some(SummaryType::FiveMinute),
            SummaryType::Daily => Some(SummaryType::Hourly),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: i64,
    pub summary_type: SummaryType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub content: SummaryContent,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryContent {
    FiveMinute(FiveMinuteContent),
    Hourly(HourlyContent),
}

impl SummaryContent {
    pub fn narrative(&self) -> &str {
        match self {
            SummaryContent::FiveMinute(content) => &content.narrative,
            SummaryContent::Hourly(content) => &content.narrative,
        }
    }

    pub fn as_five_minute(&self) -> Option<&FiveMinuteContent> {
        match self {
            SummaryContent::FiveMinute(content) => Some(content),
            SummaryContent::Hourly(_) => None,
        }
    }

    pub fn as_hourly(&self) -> Option<&HourlyContent> {
        match self {
            SummaryContent::Hourly(content) => Some(content),
            SummaryContent::FiveMinute(_) => None,
        }
    }
}

/// How often a label occurred in a window and when it was first seen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelTally {
    pub name: String,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
}

/// A change of label set between two consecutive classified captures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: Vec<String>,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiveMinuteContent {
    pub capture_count: u32,
    pub classified_count: u32,
    pub failed_count: u32,
    /// Captures whose classification had not resolved when the window was summarized.
    pub pending_count: u32,
    /// `failed_count + pending_count`.
    pub unclassified_count: u32,
    /// Ranked by count descending, then first occurrence, then name.
    pub labels: Vec<LabelTally>,
    /// Every label tied for the top count, earliest first occurrence first.
    pub dominant: Vec<String>,
    pub transitions: Vec<Transition>,
    /// Label set of the first classified capture.
    pub opening_labels: Vec<String>,
    /// Label set of the last classified capture.
    pub closing_labels: Vec<String>,
    pub highlights: Vec<String>,
    pub narrative: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Coverage {
    Full,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HourlyContent {
    pub expected_windows: u32,
    pub covered_windows: u32,
    /// Starts of five-minute windows that have no summary and no captures.
    pub missing_windows: Vec<DateTime<Utc>>,
    pub coverage: Coverage,
    pub capture_count: u32,
    pub classified_count: u32,
    pub unclassified_count: u32,
    pub labels: Vec<LabelTally>,
    pub dominant: Vec<String>,
    pub transitions: Vec<Transition>,
    pub highlights: Vec<String>,
    pub narrative: String,
}
