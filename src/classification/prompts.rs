/// Builds the per-capture classification prompt. Existing labels are listed
/// so the model reuses them; the previous five-minute narrative, when there
/// is one, gives it some continuity.
pub fn classification_prompt(existing_labels: &[String], last_summary: Option<&str>) -> String {
    let labels = if existing_labels.is_empty() {
        "None yet - create new ones".to_string()
    } else {
        existing_labels.join(", ")
    };

    let mut prompt = format!(
        "Analyze this screenshot and classify the user's activity.

EXISTING LABELS: {labels}

You can:
- Use existing labels if they fit
- Create new short lowercase labels if needed
- Assign MULTIPLE labels when activities overlap (e.g. \"meeting\" + \"reading documentation\")

Provide:
1. Labels for this activity (multiple allowed)
2. A description of what the user is doing (2-3 sentences)"
    );

    if let Some(summary) = last_summary.filter(|summary| !summary.trim().is_empty()) {
        prompt.push_str("\n\nLAST 5-MIN SUMMARY (for context):\n");
        prompt.push_str(summary);
    }

    prompt
}
