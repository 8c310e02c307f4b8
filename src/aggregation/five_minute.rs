use std::collections::HashSet;

use crate::db::{
    models::{FiveMinuteContent, Transition},
    Capture, ClassificationState,
};

use super::{
    config::AggregationConfig,
    tally::{describe_labels, dominant_labels, Tally},
    window::Window,
};

/// Builds the content of one five-minute summary from the captures taken in
/// `window`, oldest first. Failed and still-pending captures are counted but
/// contribute no labels.
pub fn compose_five_minute(
    window: &Window,
    captures: &[Capture],
    config: &AggregationConfig,
) -> FiveMinuteContent {
    let mut classified_count = 0u32;
    let mut failed_count = 0u32;
    let mut pending_count = 0u32;

    let mut tally = Tally::new();
    let mut transitions = Vec::new();
    let mut previous: Option<&Vec<String>> = None;
    let mut opening_labels = Vec::new();
    let mut closing_labels = Vec::new();

    let mut highlights = Vec::new();
    let mut seen_descriptions = HashSet::new();

    for capture in captures.iter().filter(|c| window.contains(c.timestamp)) {
        match capture.state() {
            ClassificationState::Pending => {
                pending_count += 1;
                continue;
            }
            ClassificationState::Failed => {
                failed_count += 1;
                continue;
            }
            ClassificationState::Classified => classified_count += 1,
        }

        for label in &capture.labels {
            tally.add(label, 1, capture.timestamp);
        }

        match previous {
            None => opening_labels = capture.labels.clone(),
            Some(prev) if *prev != capture.labels => transitions.push(Transition {
                at: capture.timestamp,
                from: prev.clone(),
                to: capture.labels.clone(),
            }),
            Some(_) => {}
        }
        previous = Some(&capture.labels);
        closing_labels = capture.labels.clone();

        if let Some(description) = capture.description.as_deref().map(str::trim) {
            if highlights.len() < config.max_highlights
                && !description.is_empty()
                && seen_descriptions.insert(description.to_string())
            {
                highlights.push(description.to_string());
            }
        }
    }

    let capture_count = classified_count + failed_count + pending_count;
    let unclassified_count = failed_count + pending_count;
    let labels = tally.ranked();
    let dominant = dominant_labels(&labels);

    let narrative = five_minute_narrative(
        capture_count,
        classified_count,
        failed_count,
        pending_count,
        &describe_labels(&labels, config.narrative_label_limit),
        transitions.len(),
    );

    FiveMinuteContent {
        capture_count,
        classified_count,
        failed_count,
        pending_count,
        unclassified_count,
        labels,
        dominant,
        transitions,
        opening_labels,
        closing_labels,
        highlights,
        narrative,
    }
}

fn five_minute_narrative(
    capture_count: u32,
    classified: u32,
    failed: u32,
    pending: u32,
    labels: &str,
    switches: usize,
) -> String {
    if capture_count == 0 {
        return "No activity captured in this period.".to_string();
    }

    let mut narrative = if classified == 0 {
        format!(
            "{capture_count} {} taken, none classified.",
            plural(capture_count as usize, "capture", "captures")
        )
    } else if labels.is_empty() {
        format!(
            "{classified} of {capture_count} captures classified, with no activity labels."
        )
    } else {
        format!("{classified} of {capture_count} captures classified: {labels}.")
    };

    if switches > 0 {
        narrative.push_str(&format!(
            " {switches} activity {}.",
            plural(switches, "switch", "switches")
        ));
    }

    if failed + pending > 0 {
        narrative.push_str(&format!(
            " Unclassified: {failed} failed, {pending} pending."
        ));
    }

    narrative
}

pub(super) fn plural<'a>(count: usize, one: &'a str, many: &'a str) -> &'a str {
    if count == 1 {
        one
    } else {
        many
    }
}
