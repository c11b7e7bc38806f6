//! K-way segment compaction.
//!
//! The merger concatenates the non-deleted documents of its source
//! segments in source order, remapping document ids to a compact,
//! gap-free range, and merges their term dictionaries through a priority
//! queue ordered by term key.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use log::debug;

use crate::error::{KontosError, Result};
use crate::index::config::IndexConfig;
use crate::index::segment_reader::{ScanMode, SegmentReader};
use crate::index::segment_writer::StreamWriter;
use crate::storage::Storage;

/// Priority queue entry: a source's current term key and its index.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    key: Vec<u8>,
    source: usize,
}

/// Merges a set of source segments into one new segment.
#[derive(Debug)]
pub struct SegmentMerger<'a> {
    writer: StreamWriter,
    sources: Vec<&'a mut SegmentReader>,
    merge_done: bool,
}

impl<'a> SegmentMerger<'a> {
    /// Create a new merger writing the merged segment under `name`.
    pub fn new(storage: Arc<dyn Storage>, name: &str, config: &IndexConfig) -> Self {
        SegmentMerger {
            writer: StreamWriter::new(storage, name, config),
            sources: Vec::new(),
            merge_done: false,
        }
    }

    /// Add a segment to the collection of segments to be merged.
    pub fn add_source(&mut self, segment: &'a mut SegmentReader) {
        self.sources.push(segment);
    }

    /// Perform the merge and return a reader for the new segment.
    ///
    /// Returns `None` when every source document was deleted.
    pub fn merge(mut self) -> Result<Option<SegmentReader>> {
        if self.merge_done {
            return Err(KontosError::invalid_argument("Merge is already done"));
        }
        if self.sources.is_empty() {
            return Err(KontosError::invalid_argument(
                "Wrong number of segments to be merged (0)",
            ));
        }

        debug!(
            "merging {} segments into '{}'",
            self.sources.len(),
            self.writer.name()
        );

        self.merge_fields();
        self.merge_norms()?;
        self.merge_stored_fields()?;
        self.merge_terms()?;

        self.merge_done = true;

        self.writer.close()
    }

    /// Merge field metadata from all sources.
    fn merge_fields(&mut self) {
        for segment in &self.sources {
            for field_info in segment.field_infos() {
                self.writer.add_field_info(field_info);
            }
        }
    }

    /// Merge per-field normalization vectors, dropping the bytes of
    /// deleted documents.
    fn merge_norms(&mut self) -> Result<()> {
        let fields: Vec<_> = self.writer.field_infos().to_vec();

        for field_info in fields.iter().filter(|f| f.is_indexed) {
            for segment in self.sources.iter_mut() {
                let source_norm = segment.norm_vector(&field_info.name)?;
                if segment.has_deletions() {
                    let filtered: Vec<u8> = source_norm
                        .iter()
                        .enumerate()
                        .filter(|(doc_id, _)| !segment.is_deleted(*doc_id as u32))
                        .map(|(_, byte)| *byte)
                        .collect();
                    self.writer.add_norm(&field_info.name, &filtered);
                } else {
                    self.writer.add_norm(&field_info.name, &source_norm);
                }
            }
        }

        Ok(())
    }

    /// Merge stored fields, copying every non-deleted document's records
    /// in source order and renumbering field references.
    fn merge_stored_fields(&mut self) -> Result<()> {
        for segment in self.sources.iter_mut() {
            let mut fdt = segment.open_compound_file(".fdt")?;

            for doc_id in 0..segment.count() {
                let stored_fields = segment.read_stored_record(&mut fdt)?;

                if !segment.is_deleted(doc_id) {
                    self.writer.add_stored_fields(&stored_fields)?;
                }
            }
        }

        Ok(())
    }

    /// Merge term dictionaries and postings.
    ///
    /// Every source stream runs in merge-info mode, which yields compacted,
    /// globally-offset document ids with deletions already removed. The
    /// smallest-keyed source is drained repeatedly; a term's accumulated
    /// postings are flushed once the next smallest key differs.
    fn merge_terms(&mut self) -> Result<()> {
        let mut queue: BinaryHeap<Reverse<QueueEntry>> = BinaryHeap::new();

        let mut segment_start_id = 0u32;
        for (source, segment) in self.sources.iter_mut().enumerate() {
            segment_start_id =
                segment.reset_terms_stream_with(segment_start_id, ScanMode::MergeInfo)?;

            // Skip "empty" segments.
            if let Some(term) = segment.current_term() {
                queue.push(Reverse(QueueEntry {
                    key: term.key(),
                    source,
                }));
            }
        }

        self.writer.initialize_dictionary_files()?;

        let mut term_docs: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        while let Some(Reverse(entry)) = queue.pop() {
            let segment = &mut self.sources[entry.source];

            // Merge the source's positions; ids are globally unique, so
            // existing entries are never overwritten.
            if let Some(positions) = segment.current_term_positions() {
                for (doc_id, doc_positions) in positions {
                    term_docs
                        .entry(*doc_id)
                        .or_insert_with(|| doc_positions.clone());
                }
            }

            let flush = match queue.peek() {
                Some(Reverse(top)) => top.key != entry.key,
                None => true,
            };
            if flush {
                // We got a new term. Add it if it's contained in any
                // document.
                if !term_docs.is_empty() {
                    let term = segment
                        .current_term()
                        .expect("popped source has a current term")
                        .clone();
                    self.writer.add_term(&term, &term_docs)?;
                }
                term_docs.clear();
            }

            segment.advance_term()?;
            if let Some(term) = segment.current_term() {
                queue.push(Reverse(QueueEntry {
                    key: term.key(),
                    source: entry.source,
                }));
            }
        }

        self.writer.close_dictionary_files()
    }
}
