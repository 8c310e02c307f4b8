use std::collections::HashSet;

use crate::db::models::{Coverage, FiveMinuteContent, HourlyContent, Transition};

use super::{
    config::AggregationConfig,
    five_minute::plural,
    tally::{describe_labels, dominant_labels, Tally},
    window::Window,
};

/// Rolls the five-minute tiles of one hour into its content. `tiles` holds
/// every tile of the hour in order; `None` marks a tile with no captures.
///
/// A label switch that happens across a tile boundary is not visible inside
/// either tile, so it is added here, stamped with the later tile's start.
pub fn compose_hourly(
    hour: &Window,
    tiles: &[(Window, Option<FiveMinuteContent>)],
    config: &AggregationConfig,
) -> HourlyContent {
    let mut missing_windows = Vec::new();
    let mut covered_windows = 0u32;
    let mut capture_count = 0u32;
    let mut classified_count = 0u32;
    let mut unclassified_count = 0u32;

    let mut tally = Tally::new();
    let mut transitions: Vec<Transition> = Vec::new();
    let mut previous_closing: Option<&Vec<String>> = None;

    let mut highlights = Vec::new();
    let mut seen_highlights = HashSet::new();

    for (tile, content) in tiles {
        let Some(content) = content else {
            missing_windows.push(tile.start);
            continue;
        };

        covered_windows += 1;
        capture_count += content.capture_count;
        classified_count += content.classified_count;
        unclassified_count += content.unclassified_count;

        for label in &content.labels {
            tally.add(&label.name, label.count, label.first_seen);
        }

        if content.classified_count > 0 {
            if let Some(prev) = previous_closing {
                if *prev != content.opening_labels {
                    transitions.push(Transition {
                        at: tile.start,
                        from: prev.clone(),
                        to: content.opening_labels.clone(),
                    });
                }
            }
            previous_closing = Some(&content.closing_labels);
        }
        transitions.extend(content.transitions.iter().cloned());

        if let Some(highlight) = content.highlights.first() {
            if highlights.len() < config.max_hourly_highlights
                && seen_highlights.insert(highlight.clone())
            {
                highlights.push(highlight.clone());
            }
        }
    }

    transitions.sort_by_key(|transition| transition.at);

    let labels = tally.ranked();
    let dominant = dominant_labels(&labels);
    let expected_windows = tiles.len() as u32;
    let coverage = if missing_windows.is_empty() {
        Coverage::Full
    } else {
        Coverage::Partial
    };

    let narrative = hourly_narrative(
        hour,
        HourlyFigures {
            expected_windows,
            covered_windows,
            capture_count,
            classified_count,
            unclassified_count,
            switches: transitions.len(),
        },
        &describe_labels(&labels, config.narrative_label_limit),
    );

    HourlyContent {
        expected_windows,
        covered_windows,
        missing_windows,
        coverage,
        capture_count,
        classified_count,
        unclassified_count,
        labels,
        dominant,
        transitions,
        highlights,
        narrative,
    }
}

struct HourlyFigures {
    expected_windows: u32,
    covered_windows: u32,
    capture_count: u32,
    classified_count: u32,
    unclassified_count: u32,
    switches: usize,
}

fn hourly_narrative(hour: &Window, figures: HourlyFigures, labels: &str) -> String {
    let span = format!(
        "{}-{} UTC",
        hour.start.format("%H:%M"),
        hour.end.format("%H:%M")
    );

    if figures.covered_windows == 0 {
        return format!("No activity captured in {span}.");
    }

    let mut narrative = format!(
        "{span}: {} {} across {} of {} five-minute windows",
        figures.capture_count,
        plural(figures.capture_count as usize, "capture", "captures"),
        figures.covered_windows,
        figures.expected_windows
    );

    if figures.classified_count == 0 {
        narrative.push_str(", none classified.");
    } else if labels.is_empty() {
        narrative.push_str(", with no activity labels.");
    } else {
        narrative.push_str(&format!("; {labels}."));
    }

    if figures.switches > 0 {
        narrative.push_str(&format!(
            " {} activity {}.",
            figures.switches,
            plural(figures.switches, "switch", "switches")
        ));
    }
    if figures.unclassified_count > 0 {
        narrative.push_str(&format!(
            " {} unclassified.",
            figures.unclassified_count
        ));
    }
    let missing = figures.expected_windows - figures.covered_windows;
    if missing > 0 {
        narrative.push_str(&format!(
            " Partial coverage: {missing} {} without data.",
            plural(missing as usize, "window", "windows")
        ));
    }

    narrative
}
