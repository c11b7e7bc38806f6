//! Integration tests for the segment codec: write a segment, reopen it,
//! and verify term lookup, postings, stored fields and norms.

use std::sync::Arc;

use kontos::document::{Document, Field, FieldValue};
use kontos::error::Result;
use kontos::index::segment_writer::DocumentWriter;
use kontos::index::{IndexConfig, ScanMode, SegmentReader, Term};
use kontos::search::similarity;
use kontos::storage::{MemoryStorage, Storage};

fn build_segment(
    storage: &Arc<dyn Storage>,
    name: &str,
    config: &IndexConfig,
    docs: &[Document],
) -> SegmentReader {
    let mut writer = DocumentWriter::new(Arc::clone(storage), name, config);
    for doc in docs {
        writer.add_document(doc).unwrap();
    }
    writer.close().unwrap().unwrap()
}

fn text_doc(field: &str, value: &str) -> Document {
    let mut doc = Document::new();
    doc.add_field(Field::text(field, value));
    doc
}

#[test]
fn test_terms_stream_yields_non_decreasing_keys() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    // Field registration order differs from alphabetical order on purpose.
    let mut doc = Document::new();
    doc.add_field(Field::text("zeta", "delta alpha"));
    doc.add_field(Field::text("alpha", "omega beta"));
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &[doc]);

    reader.reset_terms_stream_with(0, ScanMode::TermsOnly)?;
    let mut keys = Vec::new();
    while let Some(term) = reader.current_term() {
        keys.push(term.key());
        reader.advance_term()?;
    }

    assert_eq!(keys.len(), 4);
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "terms stream must be strictly increasing");
    }

    Ok(())
}

#[test]
fn test_term_lookup_matches_sequential_scan() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    // A small index interval produces several dictionary index samples, so
    // lookups exercise both the binary search and the linear scan tail.
    let config = IndexConfig {
        index_interval: 4,
        ..Default::default()
    };

    let words: Vec<String> = (0..60).map(|i| format!("term{i:03}")).collect();
    let docs: Vec<Document> = words
        .chunks(6)
        .map(|chunk| text_doc("body", &chunk.join(" ")))
        .collect();
    let mut reader = build_segment(&storage, "_0", &config, &docs);

    // Collect every term with its info through the stream.
    let mut streamed = Vec::new();
    reader.reset_terms_stream_with(0, ScanMode::TermsOnly)?;
    while let Some(term) = reader.current_term() {
        let info = reader.current_term_info().unwrap().clone();
        streamed.push((term.clone(), info));
        reader.advance_term()?;
    }
    assert_eq!(streamed.len(), 60);

    // The binary-search path must agree with the sequential scan.
    for (term, expected) in &streamed {
        let found = reader.get_term_info(term)?.unwrap();
        assert_eq!(found.doc_freq, expected.doc_freq);
        assert_eq!(found.freq_pointer, expected.freq_pointer);
        assert_eq!(found.prox_pointer, expected.prox_pointer);
    }

    // Lookups outside the dictionary return None, cached or not.
    assert!(reader.get_term_info(&Term::new("body", "absent"))?.is_none());
    assert!(reader.get_term_info(&Term::new("body", "absent"))?.is_none());
    assert!(reader.get_term_info(&Term::new("missing", "x"))?.is_none());

    Ok(())
}

#[test]
fn test_postings_hello_in_docs_0_and_2() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![
        text_doc("body", "hello world"),
        text_doc("body", "nothing here"),
        text_doc("body", "hello again"),
    ];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    let term = Term::new("body", "hello");
    assert_eq!(reader.term_docs(&term, 0, None)?, vec![0, 2]);

    let freqs = reader.term_freqs(&term, 0, None)?;
    assert_eq!(freqs.len(), 2);
    assert_eq!(freqs[&0], 1);
    assert_eq!(freqs[&2], 1);

    // Shift offsets ids for multi-segment reads.
    assert_eq!(reader.term_docs(&term, 100, None)?, vec![100, 102]);

    Ok(())
}

#[test]
fn test_positions_and_frequencies() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![text_doc("body", "red fish blue fish red fish")];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    let freqs = reader.term_freqs(&Term::new("body", "fish"), 0, None)?;
    assert_eq!(freqs[&0], 3);

    // Positions accumulate from the position increments: tokens are at
    // positions 1..=6.
    let positions = reader.term_positions(&Term::new("body", "fish"), 0, None)?;
    assert_eq!(positions[&0], vec![2, 4, 6]);
    let positions = reader.term_positions(&Term::new("body", "red"), 0, None)?;
    assert_eq!(positions[&0], vec![1, 5]);

    Ok(())
}

#[test]
fn test_docs_filter_narrows_and_stays_in_sync() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![
        text_doc("body", "common alpha"),
        text_doc("body", "common beta"),
        text_doc("body", "common gamma"),
    ];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    let mut filter = kontos::index::DocsFilter::new();

    // First scan seeds the filter with all matches.
    let docs_found = reader.term_docs(&Term::new("body", "common"), 0, Some(&mut filter))?;
    assert_eq!(docs_found, vec![0, 1, 2]);
    assert_eq!(filter.segment_filters["_0"].len(), 3);

    // A narrower term shrinks the filter.
    let docs_found = reader.term_docs(&Term::new("body", "beta"), 0, Some(&mut filter))?;
    assert_eq!(docs_found, vec![1]);
    assert_eq!(filter.segment_filters["_0"].len(), 1);

    // Position reads honor the narrowed filter but keep the position
    // stream aligned.
    let positions = reader.term_positions(&Term::new("body", "common"), 0, Some(&mut filter))?;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[&1], vec![1]);

    // A missing term empties the filter for the segment.
    reader.term_docs(&Term::new("body", "absent"), 0, Some(&mut filter))?;
    assert!(filter.segment_filters["_0"].is_empty());
    let docs_found = reader.term_docs(&Term::new("body", "common"), 0, Some(&mut filter))?;
    assert!(docs_found.is_empty());

    Ok(())
}

#[test]
fn test_stored_fields_round_trip() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let payload: Vec<u8> = (0..=255).collect();
    let mut doc = Document::new();
    doc.add_field(Field::text("title", "héllo wörld 日本語"));
    doc.add_field(Field::keyword("id", "doc-1"));
    doc.add_field(Field::binary("payload", payload.clone()));
    doc.add_field(Field::un_stored("hidden", "not stored"));

    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &[doc]);
    let stored = reader.document(0)?;

    // Unstored fields don't come back; stored ones are byte-identical
    // with their original encodings.
    assert_eq!(stored.fields().len(), 3);
    let title = stored.field("title").unwrap();
    assert_eq!(title.value.as_text().unwrap(), "héllo wörld 日本語");
    assert!(title.is_tokenized);

    let id = stored.field("id").unwrap();
    assert_eq!(id.value.as_text().unwrap(), "doc-1");
    assert!(!id.is_tokenized);

    let blob = stored.field("payload").unwrap();
    assert!(blob.is_binary());
    assert_eq!(blob.value, FieldValue::Binary(payload));

    assert!(stored.field("hidden").is_none());

    // The indexed-but-unstored field is still searchable.
    assert_eq!(reader.term_docs(&Term::new("hidden", "stored"), 0, None)?, vec![0]);

    Ok(())
}

#[test]
fn test_norms_decode() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![
        text_doc("body", "one two three four"),
        text_doc("body", "single"),
    ];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    // 4 tokens: 1/sqrt(4) = 0.5 survives quantization exactly.
    assert_eq!(reader.norm(0, "body")?, Some(0.5));
    assert_eq!(reader.norm(1, "body")?, Some(1.0));

    // Norms for unknown fields come back as None.
    assert_eq!(reader.norm(0, "missing")?, None);

    // A missing field still yields a synthetic norm vector for merging.
    let vector = reader.norm_vector("missing")?;
    assert_eq!(vector.len(), 2);
    assert_eq!(
        vector[0],
        similarity::encode_norm(similarity::length_norm(0))
    );

    Ok(())
}

#[test]
fn test_skip_to_relocates_stream() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexConfig {
        index_interval: 4,
        ..Default::default()
    };
    let words: Vec<String> = (0..40).map(|i| format!("w{i:02}")).collect();
    let docs = vec![text_doc("body", &words.join(" "))];
    let mut reader = build_segment(&storage, "_0", &config, &docs);

    reader.reset_terms_stream_with(0, ScanMode::TermsOnly)?;

    // Skip to an existing term.
    reader.skip_terms_to(&Term::new("body", "w17"))?;
    assert_eq!(reader.current_term().unwrap().text, "w17");

    // Skip to a prefix between terms lands on the next greater term.
    reader.skip_terms_to(&Term::new("body", "w175"))?;
    assert_eq!(reader.current_term().unwrap().text, "w18");

    // Skipping backwards re-runs the binary search.
    reader.skip_terms_to(&Term::new("body", "w03"))?;
    assert_eq!(reader.current_term().unwrap().text, "w03");

    // Skipping past the end exhausts the stream.
    reader.skip_terms_to(&Term::new("body", "zzz"))?;
    assert!(reader.current_term().is_none());

    // A field missing from the segment exhausts the stream too.
    reader.reset_terms_stream_with(0, ScanMode::TermsOnly)?;
    reader.skip_terms_to(&Term::new("nope", "a"))?;
    assert!(reader.current_term().is_none());

    Ok(())
}

#[test]
fn test_full_info_stream_carries_positions() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![
        text_doc("body", "apple banana apple"),
        text_doc("body", "banana"),
    ];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    reader.reset_terms_stream_with(0, ScanMode::FullInfo)?;

    let term = reader.current_term().unwrap().clone();
    assert_eq!(term.text, "apple");
    let positions = reader.current_term_positions().unwrap();
    assert_eq!(positions[&0], vec![1, 3]);

    reader.advance_term()?;
    let term = reader.current_term().unwrap().clone();
    assert_eq!(term.text, "banana");
    let positions = reader.current_term_positions().unwrap();
    assert_eq!(positions[&0], vec![2]);
    assert_eq!(positions[&1], vec![1]);

    assert!(reader.advance_term()?.is_none());

    Ok(())
}

#[test]
fn test_reopen_uses_sti_dictionary_cache() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let docs = vec![text_doc("body", "alpha beta gamma")];
    let mut reader = build_segment(&storage, "_0", &IndexConfig::default(), &docs);

    assert!(reader.get_term_info(&Term::new("body", "beta"))?.is_some());
    assert!(storage.file_exists("_0.sti"));

    // A second reader loads the cached index and agrees.
    let mut reopened = SegmentReader::open(
        Arc::clone(&storage),
        "_0",
        1,
        -1,
        None,
        true,
        Some(true),
    )?;
    assert!(reopened.get_term_info(&Term::new("body", "beta"))?.is_some());
    assert!(reopened.get_term_info(&Term::new("body", "delta"))?.is_none());

    Ok(())
}
