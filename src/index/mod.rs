//! Index storage engine: segments, their codec, merging, and the
//! write-path orchestration.

pub mod config;
pub mod deletions;
pub mod dictionary;
pub mod docs_filter;
pub mod field_info;
pub mod lock;
pub mod segment_merger;
pub mod segment_reader;
pub mod segment_writer;
pub mod segments;
pub mod term;
pub mod writer;

pub use config::IndexConfig;
pub use deletions::DeletionSet;
pub use docs_filter::DocsFilter;
pub use field_info::FieldInfo;
pub use segment_merger::SegmentMerger;
pub use segment_reader::{ScanMode, SegmentReader, TermsStream};
pub use segment_writer::{DocumentWriter, StreamWriter};
pub use segments::FormatVersion;
pub use term::{Term, TermInfo};
pub use writer::{IndexWriter, SegmentRegistry};

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::document::Document;
use crate::error::{KontosError, Result};
use crate::storage::{LockFile, Storage};

/// A read/write handle on an index directory.
///
/// Opening an index obtains the shared read lock and pins the current
/// generation: the segments visible to this handle only change through its
/// own writes. The lock is held for the handle's whole lifetime, which
/// guarantees no concurrent writer deletes a file this handle may still
/// reference.
#[derive(Debug)]
pub struct Index {
    storage: Arc<dyn Storage>,
    segments: SegmentRegistry,
    /// Segment names in segments-file order, for global doc numbering.
    segment_order: Vec<String>,
    read_lock: Arc<Mutex<Box<dyn LockFile>>>,
    writer: Option<IndexWriter>,
    generation: i64,
    config: IndexConfig,
}

impl Index {
    /// Open an existing index.
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Self> {
        let read_lock = Arc::new(Mutex::new(lock::obtain_read_lock(storage.as_ref())?));

        let generation = segments::actual_generation(storage.as_ref())?;
        if generation < 0 {
            return Err(KontosError::index("Index doesn't exist in the directory"));
        }

        let parsed = segments::read_segments_file_at(storage.as_ref(), generation)?;

        let mut registry = AHashMap::new();
        let mut segment_order = Vec::with_capacity(parsed.segments.len());
        for entry in &parsed.segments {
            let segment = SegmentReader::open(
                Arc::clone(&storage),
                &entry.name,
                entry.doc_count,
                entry.del_gen,
                entry.doc_store.clone(),
                entry.has_single_norm_file,
                entry.is_compound(),
            )?;
            registry.insert(entry.name.clone(), segment);
            segment_order.push(entry.name.clone());
        }

        Ok(Index {
            storage,
            segments: Arc::new(Mutex::new(registry)),
            segment_order,
            read_lock,
            writer: None,
            generation,
            config,
        })
    }

    /// Create a new empty index, replacing the current generation.
    pub fn create(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Self> {
        let generation = segments::actual_generation(storage.as_ref())?;
        let new_generation = if generation < 1 { 1 } else { generation + 1 };
        segments::create_index(storage.as_ref(), new_generation, 0)?;

        Self::open(storage, config)
    }

    /// The generation this handle currently sees.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Names and doc counts of the segments, in segments-file order.
    pub fn segments(&self) -> Vec<(String, u32)> {
        let registry = self.segments.lock();
        self.segment_order
            .iter()
            .filter_map(|name| registry.get(name).map(|s| (name.clone(), s.count())))
            .collect()
    }

    fn writer(&mut self) -> &mut IndexWriter {
        if self.writer.is_none() {
            self.writer = Some(IndexWriter::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.segments),
                Arc::clone(&self.read_lock),
                self.config.clone(),
            ));
        }
        self.writer.as_mut().expect("created above")
    }

    /// Re-derive the segment order after this handle published a new
    /// generation through its writer.
    fn refresh(&mut self) -> Result<()> {
        self.generation = segments::actual_generation(self.storage.as_ref())?;
        let parsed = segments::read_segments_file_at(self.storage.as_ref(), self.generation)?;
        self.segment_order = parsed.segments.iter().map(|e| e.name.clone()).collect();
        Ok(())
    }

    /// Add a document to the index.
    pub fn add_document(&mut self, document: &Document) -> Result<()> {
        self.writer().add_document(document)?;
        self.refresh()
    }

    /// Commit buffered documents and deletion changes.
    pub fn commit(&mut self) -> Result<()> {
        self.writer().commit()?;
        self.refresh()
    }

    /// Merge all segments into one. Returns `false` when another process
    /// is already optimizing.
    pub fn optimize(&mut self) -> Result<bool> {
        let optimized = self.writer().optimize()?;
        self.refresh()?;
        Ok(optimized)
    }

    /// Total number of documents, including deleted ones.
    pub fn doc_count(&self) -> u32 {
        let registry = self.segments.lock();
        self.segment_order
            .iter()
            .filter_map(|name| registry.get(name).map(|s| s.count()))
            .sum()
    }

    /// Number of non-deleted documents.
    pub fn num_docs(&self) -> u32 {
        let registry = self.segments.lock();
        self.segment_order
            .iter()
            .filter_map(|name| registry.get(name).map(|s| s.num_docs()))
            .sum()
    }

    /// Resolve a global document id to its segment and local id.
    fn locate(&self, id: u32) -> Result<(String, u32)> {
        let registry = self.segments.lock();
        let mut base = 0u32;
        for name in &self.segment_order {
            let Some(segment) = registry.get(name) else {
                continue;
            };
            if id < base + segment.count() {
                return Ok((name.clone(), id - base));
            }
            base += segment.count();
        }

        Err(KontosError::invalid_argument(format!(
            "Document id {id} is out of range"
        )))
    }

    /// Read the stored fields of a document by global id.
    pub fn document(&mut self, id: u32) -> Result<Document> {
        let (name, local_id) = self.locate(id)?;
        let mut registry = self.segments.lock();
        registry
            .get_mut(&name)
            .expect("located above")
            .document(local_id)
    }

    /// Check whether a document is deleted.
    pub fn is_deleted(&self, id: u32) -> Result<bool> {
        let (name, local_id) = self.locate(id)?;
        let registry = self.segments.lock();
        Ok(registry.get(&name).expect("located above").is_deleted(local_id))
    }

    /// Delete a document by global id.
    ///
    /// The deletion is persisted at the next [`Index::commit`].
    pub fn delete(&mut self, id: u32) -> Result<()> {
        let (name, local_id) = self.locate(id)?;
        let mut registry = self.segments.lock();
        registry.get_mut(&name).expect("located above").delete(local_id);
        Ok(())
    }

    /// Whether the index contains the term.
    pub fn has_term(&mut self, term: &Term) -> Result<bool> {
        let mut registry = self.segments.lock();
        for name in &self.segment_order {
            let Some(segment) = registry.get_mut(name) else {
                continue;
            };
            if segment.get_term_info(term)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Global ids of all documents containing the term.
    pub fn term_docs(
        &mut self,
        term: &Term,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<Vec<u32>> {
        let mut registry = self.segments.lock();
        let mut result = Vec::new();
        let mut shift = 0u32;
        let mut filter = docs_filter;

        for name in &self.segment_order {
            let Some(segment) = registry.get_mut(name) else {
                continue;
            };
            result.extend(segment.term_docs(term, shift, filter.as_deref_mut())?);
            shift += segment.count();
        }

        Ok(result)
    }

    /// Term frequencies keyed by global document id.
    pub fn term_freqs(
        &mut self,
        term: &Term,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<BTreeMap<u32, u32>> {
        let mut registry = self.segments.lock();
        let mut result = BTreeMap::new();
        let mut shift = 0u32;
        let mut filter = docs_filter;

        for name in &self.segment_order {
            let Some(segment) = registry.get_mut(name) else {
                continue;
            };
            result.extend(segment.term_freqs(term, shift, filter.as_deref_mut())?);
            shift += segment.count();
        }

        Ok(result)
    }

    /// Term positions keyed by global document id.
    pub fn term_positions(
        &mut self,
        term: &Term,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<BTreeMap<u32, Vec<u32>>> {
        let mut registry = self.segments.lock();
        let mut result = BTreeMap::new();
        let mut shift = 0u32;
        let mut filter = docs_filter;

        for name in &self.segment_order {
            let Some(segment) = registry.get_mut(name) else {
                continue;
            };
            result.extend(segment.term_positions(term, shift, filter.as_deref_mut())?);
            shift += segment.count();
        }

        Ok(result)
    }

    /// Normalization factor for a document and field.
    pub fn norm(&mut self, id: u32, field_name: &str) -> Result<Option<f32>> {
        let (name, local_id) = self.locate(id)?;
        let mut registry = self.segments.lock();
        registry
            .get_mut(&name)
            .expect("located above")
            .norm(local_id, field_name)
    }

    /// Release the read lock and close the handle.
    pub fn close(self) -> Result<()> {
        self.read_lock.lock().unlock()
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let _ = self.read_lock.lock().unlock();
    }
}
