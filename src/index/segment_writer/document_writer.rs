//! Buffered segment writer for newly indexed documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::analysis::Analyzer;
use crate::document::Document;
use crate::error::{KontosError, Result};
use crate::index::config::IndexConfig;
use crate::index::segment_reader::SegmentReader;
use crate::index::segment_writer::SegmentWriterBase;
use crate::index::term::Term;
use crate::search::similarity;
use crate::storage::Storage;

#[derive(Debug)]
struct PostingsEntry {
    term: Term,
    docs: BTreeMap<u32, Vec<u32>>,
}

/// A segment writer that accumulates an in-memory inverted index and
/// flushes it sorted by term key when the buffer closes.
#[derive(Debug)]
pub struct DocumentWriter {
    base: SegmentWriterBase,
    analyzer: Arc<dyn Analyzer>,

    /// In-memory term dictionary keyed by term key, which keeps it in
    /// dictionary order.
    term_dictionary: BTreeMap<Vec<u8>, PostingsEntry>,
}

impl DocumentWriter {
    /// Create a new document writer for the named segment.
    pub fn new(storage: Arc<dyn Storage>, name: &str, config: &IndexConfig) -> Self {
        DocumentWriter {
            base: SegmentWriterBase::new(storage, name, config),
            analyzer: Arc::clone(&config.analyzer),
            term_dictionary: BTreeMap::new(),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Number of buffered documents.
    pub fn count(&self) -> u32 {
        self.base.count()
    }

    /// Add a document to this segment.
    pub fn add_document(&mut self, document: &Document) -> Result<()> {
        let mut stored_fields = Vec::new();
        let mut doc_norms: AHashMap<String, u8> = AHashMap::new();

        for field in document.fields() {
            let mut field = field.clone();

            if field.store_term_vector {
                return Err(KontosError::other(
                    "Store term vector functionality is not supported yet",
                ));
            }

            if field.is_indexed {
                if field.is_tokenized {
                    let text = field.value.as_text().ok_or_else(|| {
                        KontosError::invalid_argument(format!(
                            "Binary field '{}' cannot be tokenized",
                            field.name
                        ))
                    })?;

                    let tokens = self.analyzer.tokenize(text);
                    if tokens.is_empty() {
                        // Field contains an empty value; treat it as
                        // non-indexed and non-tokenized.
                        field.is_indexed = false;
                        field.is_tokenized = false;
                    } else {
                        let mut position = 0u32;
                        for token in &tokens {
                            position += token.position_increment;
                            self.post_term(&field.name, &token.text, position);
                        }

                        doc_norms.insert(
                            field.name.clone(),
                            similarity::encode_norm(
                                similarity::length_norm(tokens.len() as u32)
                                    * document.boost
                                    * field.boost,
                            ),
                        );
                    }
                } else {
                    let text = field.value.as_text().ok_or_else(|| {
                        KontosError::invalid_argument(format!(
                            "Binary field '{}' cannot be indexed",
                            field.name
                        ))
                    })?;

                    if text.is_empty() {
                        // Field contains an empty value; treat it as
                        // non-indexed and non-tokenized.
                        field.is_indexed = false;
                        field.is_tokenized = false;
                    } else {
                        let text = text.to_string();
                        self.post_term(&field.name, &text, 0);
                        doc_norms.insert(
                            field.name.clone(),
                            similarity::encode_norm(
                                similarity::length_norm(1) * document.boost * field.boost,
                            ),
                        );
                    }
                }
            }

            if field.is_stored {
                stored_fields.push(field.clone());
            }

            self.base.add_field(&field);
        }

        // Grow every indexed field's norm vector by one byte, backfilling
        // fields this document doesn't carry with the default norm.
        let doc_count = self.base.count() as usize;
        let default_norm = similarity::encode_norm(similarity::length_norm(0));
        let indexed_fields: Vec<String> = self
            .base
            .field_infos()
            .iter()
            .filter(|f| f.is_indexed)
            .map(|f| f.name.clone())
            .collect();
        for field_name in indexed_fields {
            let vector = self.base.norms.entry(field_name.clone()).or_default();
            vector.resize(doc_count, default_norm);
            vector.push(*doc_norms.get(&field_name).unwrap_or(&default_norm));
        }

        self.base.add_stored_fields(&stored_fields)
    }

    fn post_term(&mut self, field_name: &str, text: &str, position: u32) {
        let doc_id = self.base.count();
        let term = Term::new(field_name, text);
        let entry = self
            .term_dictionary
            .entry(term.key())
            .or_insert_with(|| PostingsEntry {
                term,
                docs: BTreeMap::new(),
            });
        entry.docs.entry(doc_id).or_default().push(position);
    }

    /// Close the segment, write it to disk and return a reader for it.
    ///
    /// Returns `None` when no documents were buffered.
    pub fn close(mut self) -> Result<Option<SegmentReader>> {
        if self.base.count() == 0 {
            return Ok(None);
        }

        self.base.dump_fnm()?;
        self.dump_dictionary()?;
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

    /// Dump the buffered term dictionary and postings.
    fn dump_dictionary(&mut self) -> Result<()> {
        self.base.initialize_dictionary_files()?;

        for entry in self.term_dictionary.values() {
            self.base.add_term(&entry.term, &entry.docs)?;
        }

        self.base.close_dictionary_files()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Field;
    use crate::storage::MemoryStorage;

    fn make_doc(title: &str, id: &str) -> Document {
        let mut doc = Document::new();
        doc.add_field(Field::text("title", title));
        doc.add_field(Field::keyword("id", id));
        doc
    }

    #[test]
    fn test_empty_writer_closes_to_none() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = DocumentWriter::new(storage, "_0", &IndexConfig::default());
        assert!(writer.close().unwrap().is_none());
    }

    #[test]
    fn test_close_produces_compound_segment() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer =
            DocumentWriter::new(Arc::clone(&storage), "_0", &IndexConfig::default());

        writer.add_document(&make_doc("hello world", "doc1")).unwrap();
        writer.add_document(&make_doc("hello again", "doc2")).unwrap();
        assert_eq!(writer.count(), 2);

        let reader = writer.close().unwrap().unwrap();
        assert_eq!(reader.count(), 2);
        assert!(reader.is_compound());

        // Loose component files were packed away.
        assert!(storage.file_exists("_0.cfs"));
        assert!(!storage.file_exists("_0.tis"));
        assert!(!storage.file_exists("_0.fdt"));
    }

    #[test]
    fn test_empty_field_value_demoted() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer = DocumentWriter::new(storage, "_0", &IndexConfig::default());

        let mut doc = Document::new();
        doc.add_field(Field::text("body", "   "));
        writer.add_document(&doc).unwrap();

        // The field produced no tokens, so it is registered unindexed.
        let mut reader = writer.close().unwrap().unwrap();
        let info = reader.field(0).unwrap();
        assert!(!info.is_indexed);
        let doc = reader.document(0).unwrap();
        assert_eq!(doc.field("body").unwrap().value.as_text().unwrap(), "   ");
    }

    #[test]
    fn test_term_vector_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let mut writer = DocumentWriter::new(storage, "_0", &IndexConfig::default());

        let mut doc = Document::new();
        let mut field = Field::text("body", "text");
        field.store_term_vector = true;
        doc.add_field(field);

        assert!(writer.add_document(&doc).is_err());
    }
}
