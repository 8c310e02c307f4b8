/// Tunables for summary composition.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Distinct capture descriptions quoted per five-minute window.
    pub max_highlights: usize,

    /// Highlights carried up into an hourly summary.
    pub max_hourly_highlights: usize,

    /// Labels named in a narrative sentence before "and N more".
    pub narrative_label_limit: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_highlights: 3,
            max_hourly_highlights: 5,
            narrative_label_limit: 3,
        }
    }
}
