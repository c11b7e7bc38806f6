//! Streaming segment writer fed by the segment merger.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::document::Field;
use crate::error::Result;
use crate::index::config::IndexConfig;
use crate::index::field_info::FieldInfo;
use crate::index::segment_reader::SegmentReader;
use crate::index::segment_writer::SegmentWriterBase;
use crate::index::term::Term;
use crate::storage::Storage;

/// A segment writer that accepts already-sorted postings and streams them
/// straight to disk, never holding the full dictionary in memory.
#[derive(Debug)]
pub struct StreamWriter {
    base: SegmentWriterBase,
}

impl StreamWriter {
    /// Create a new stream writer for the named segment.
    pub fn new(storage: Arc<dyn Storage>, name: &str, config: &IndexConfig) -> Self {
        StreamWriter {
            base: SegmentWriterBase::new(storage, name, config),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Number of documents written so far.
    pub fn count(&self) -> u32 {
        self.base.count()
    }

    /// Create the stored fields files and open them for writing.
    pub fn create_stored_fields_files(&mut self) -> Result<()> {
        self.base.create_stored_fields_files()
    }

    /// Register a field from a source segment.
    pub fn add_field_info(&mut self, field_info: &FieldInfo) -> u32 {
        self.base.add_field_info(field_info)
    }

    /// Field infos registered so far.
    pub fn field_infos(&self) -> &[FieldInfo] {
        self.base.field_infos()
    }

    /// Append a norm vector for a field.
    pub fn add_norm(&mut self, field_name: &str, norm_vector: &[u8]) {
        self.base.add_norm(field_name, norm_vector);
    }

    /// Append one document's stored fields.
    pub fn add_stored_fields(&mut self, stored_fields: &[Field]) -> Result<()> {
        self.base.add_stored_fields(stored_fields)
    }

    /// Create the dictionary files and write their headers.
    pub fn initialize_dictionary_files(&mut self) -> Result<()> {
        self.base.initialize_dictionary_files()
    }

    /// Write one term and its postings; terms must arrive in dictionary
    /// order.
    pub fn add_term(&mut self, term: &Term, term_docs: &BTreeMap<u32, Vec<u32>>) -> Result<()> {
        self.base.add_term(term, term_docs)
    }

    /// Finish the dictionary files.
    pub fn close_dictionary_files(&mut self) -> Result<()> {
        self.base.close_dictionary_files()
    }

    /// Close the segment, write it to disk and return a reader for it.
    ///
    /// Returns `None` when the segment received no documents.
    pub fn close(mut self) -> Result<Option<SegmentReader>> {
        if self.base.count() == 0 {
            return Ok(None);
        }

        self.base.dump_fnm()?;
        self.base.generate_cfs()?;

        let storage = Arc::clone(self.base.storage());
        let reader = SegmentReader::open(
            storage,
            self.base.name(),
            self.base.count(),
            -1,
            None,
            true,
            Some(true),
        )?;
        Ok(Some(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_empty_stream_writer_closes_to_none() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = StreamWriter::new(storage, "_1", &IndexConfig::default());
        assert!(writer.close().unwrap().is_none());
    }

    #[test]
    fn test_stream_writer_stored_fields() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer =
            StreamWriter::new(Arc::clone(&storage), "_1", &IndexConfig::default());

        let info = FieldInfo::new("id", 0, true, false);
        writer.add_field_info(&info);
        writer.add_norm("id", &[0x7C]);
        writer
            .add_stored_fields(&[Field::keyword("id", "doc1")])
            .unwrap();

        // The merged dictionary is written through the shared routines.
        writer.initialize_dictionary_files().unwrap();
        let mut docs = BTreeMap::new();
        docs.insert(0u32, vec![0u32]);
        writer.add_term(&Term::new("id", "doc1"), &docs).unwrap();
        writer.close_dictionary_files().unwrap();

        let mut reader = writer.close().unwrap().unwrap();
        assert_eq!(reader.count(), 1);
        let doc = reader.document(0).unwrap();
        assert_eq!(doc.field("id").unwrap().value.as_text().unwrap(), "doc1");
    }
}
