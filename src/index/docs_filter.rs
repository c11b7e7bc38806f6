//! Candidate-document filters for postings scans.

use ahash::{AHashMap, AHashSet};

/// A per-query, per-segment set of candidate local document ids.
///
/// It may or _may not_ be used for actual filtering; it is a hint that an
/// outer query limits results to the given documents. Postings scans narrow
/// the per-segment sets as terms are looked up, so repeated scans touch
/// fewer and fewer candidates.
#[derive(Debug, Clone, Default)]
pub struct DocsFilter {
    /// Candidate document ids keyed by segment name.
    pub segment_filters: AHashMap<String, AHashSet<u32>>,
}

impl DocsFilter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        DocsFilter::default()
    }
}
