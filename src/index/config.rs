//! Index writer configuration.

use std::sync::Arc;

use crate::analysis::{Analyzer, TextAnalyzer};
use crate::index::segments::FormatVersion;

/// Tunables for the index writer, merger and segment writers.
///
/// A configuration value is threaded through the constructors explicitly;
/// there is no process-wide state.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of documents buffered in memory before they are written into
    /// a new segment.
    pub max_buffered_docs: u32,

    /// Largest number of documents ever merged by `add_document`. Small
    /// values are best for interactive indexing, as they limit the length
    /// of indexing pauses; larger values are best for batched indexing and
    /// speedier searches.
    pub max_merge_docs: u32,

    /// Determines how often segments are merged by `add_document`. With
    /// smaller values less RAM is used while indexing and searches on
    /// unoptimized indices are faster, but indexing speed is slower.
    pub merge_factor: u32,

    /// The fraction of dictionary terms sampled into the dictionary index.
    /// Smaller values use more memory but make term lookup slightly
    /// faster.
    pub index_interval: u32,

    /// The fraction of postings entries stored in skip tables.
    /// `0x7FFF_FFFF` disables skip data.
    pub skip_interval: u32,

    /// The maximum number of skip levels. 0 disables skip data.
    pub max_skip_levels: u32,

    /// Format version written by the index writer.
    pub target_format: FormatVersion,

    /// Analyzer used to tokenize indexed fields.
    pub analyzer: Arc<dyn Analyzer>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            max_buffered_docs: 10,
            max_merge_docs: u32::MAX,
            merge_factor: 10,
            index_interval: 128,
            skip_interval: 0x7FFF_FFFF,
            max_skip_levels: 0,
            target_format: FormatVersion::V21,
            analyzer: Arc::new(TextAnalyzer::new()),
        }
    }
}
