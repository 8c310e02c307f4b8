//! Label counting shared by both summary tiers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::db::models::LabelTally;

#[derive(Debug, Default)]
pub struct Tally {
    entries: HashMap<String, (u32, DateTime<Utc>)>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` occurrences of `name`, first seen at `seen_at`.
    pub fn add(&mut self, name: &str, count: u32, seen_at: DateTime<Utc>) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert((0, seen_at));
        entry.0 += count;
        if seen_at < entry.1 {
            entry.1 = seen_at;
        }
    }

    /// Count descending, then earliest first occurrence, then name.
    pub fn ranked(&self) -> Vec<LabelTally> {
        let mut ranked: Vec<LabelTally> = self
            .entries
            .iter()
            .map(|(name, (count, first_seen))| LabelTally {
                name: name.clone(),
                count: *count,
                first_seen: *first_seen,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.first_seen.cmp(&b.first_seen))
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked
    }
}

/// Every label tied for the highest count, in ranked order.
pub fn dominant_labels(ranked: &[LabelTally]) -> Vec<String> {
    let Some(top) = ranked.first().map(|tally| tally.count) else {
        return Vec::new();
    };
    ranked
        .iter()
        .take_while(|tally| tally.count == top)
        .map(|tally| tally.name.clone())
        .collect()
}

/// "coding (15), browsing (5) and 2 more"
pub fn describe_labels(ranked: &[LabelTally], limit: usize) -> String {
    let named: Vec<String> = ranked
        .iter()
        .take(limit.max(1))
        .map(|tally| format!("{} ({})", tally.name, tally.count))
        .collect();
    let rest = ranked.len().saturating_sub(named.len());

    match (named.split_last(), rest) {
        (None, _) => String::new(),
        (Some((last, [])), 0) => last.clone(),
        (Some((last, init)), 0) => format!("{} and {}", init.join(", "), last),
        (Some(_), rest) => format!("{} and {} more", named.join(", "), rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn ties_break_by_first_occurrence_then_name() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut tally = Tally::new();
        tally.add("meeting", 2, t0 + Duration::seconds(30));
        tally.add("coding", 2, t0);
        tally.add("browsing", 2, t0 + Duration::seconds(30));
        tally.add("email", 1, t0 - Duration::seconds(30));

        let ranked = tally.ranked();
        let names: Vec<_> = ranked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["coding", "browsing", "meeting", "email"]);
        assert_eq!(
            dominant_labels(&ranked),
            vec!["coding", "browsing", "meeting"]
        );
    }

    #[test]
    fn merged_counts_keep_earliest_first_seen() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut tally = Tally::new();
        tally.add("coding", 3, t0 + Duration::minutes(5));
        tally.add("coding", 4, t0);

        let ranked = tally.ranked();
        assert_eq!(ranked[0].count, 7);
        assert_eq!(ranked[0].first_seen, t0);
    }

    #[test]
    fn label_descriptions_read_naturally() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut tally = Tally::new();
        assert_eq!(describe_labels(&tally.ranked(), 3), "");

        tally.add("coding", 15, t0);
        assert_eq!(describe_labels(&tally.ranked(), 3), "coding (15)");

        tally.add("browsing", 5, t0);
        assert_eq!(
            describe_labels(&tally.ranked(), 3),
            "coding (15) and browsing (5)"
        );

        tally.add("email", 1, t0);
        tally.add("chat", 1, t0);
        assert_eq!(
            describe_labels(&tally.ranked(), 2),
            "coding (15), browsing (5) and 2 more"
        );
    }
}
