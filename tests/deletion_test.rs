//! Integration tests for document deletion: delete-file generations,
//! persistence, monotonicity and the sparse wire format.

use std::sync::Arc;

use kontos::document::{Document, Field};
use kontos::error::Result;
use kontos::index::segment_writer::DocumentWriter;
use kontos::index::{Index, IndexConfig, SegmentReader, Term};
use kontos::storage::{MemoryStorage, Storage, StructWriter};

fn build_segment(storage: &Arc<dyn Storage>, name: &str, bodies: &[&str]) -> SegmentReader {
    let config = IndexConfig::default();
    let mut writer = DocumentWriter::new(Arc::clone(storage), name, &config);
    for body in bodies {
        let mut doc = Document::new();
        doc.add_field(Field::text("body", *body));
        writer.add_document(&doc).unwrap();
    }
    writer.close().unwrap().unwrap()
}

fn reopen(storage: &Arc<dyn Storage>, name: &str, doc_count: u32) -> SegmentReader {
    // Delete generation -2 autodetects the latest delete file.
    SegmentReader::open(
        Arc::clone(storage),
        name,
        doc_count,
        kontos::index::segment_reader::DETECT_LATEST_DEL_GEN,
        None,
        true,
        Some(true),
    )
    .unwrap()
}

#[test]
fn test_delete_write_changes_reopen() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["one", "two", "three"]);

    assert_eq!(segment.del_gen(), -1);
    segment.delete(1);
    assert!(segment.is_deleted(1));
    assert_eq!(segment.num_docs(), 2);

    segment.write_changes()?;
    // The delete generation advanced by exactly one (from none to 1).
    assert_eq!(segment.del_gen(), 1);
    assert!(storage.file_exists("_0_1.del"));

    let reopened = reopen(&storage, "_0", 3);
    assert_eq!(reopened.del_gen(), 1);
    assert!(reopened.is_deleted(1));
    assert!(!reopened.is_deleted(0));
    assert!(!reopened.is_deleted(2));
    assert_eq!(reopened.num_docs(), 2);
    assert_eq!(reopened.count(), 3);

    Ok(())
}

#[test]
fn test_deletion_generations_are_incremental() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["one", "two", "three"]);

    segment.delete(0);
    segment.write_changes()?;
    assert_eq!(segment.del_gen(), 1);

    segment.delete(2);
    segment.write_changes()?;
    assert_eq!(segment.del_gen(), 2);
    assert!(storage.file_exists("_0_2.del"));

    // Deletions are monotonic: both survive the reopen.
    let reopened = reopen(&storage, "_0", 3);
    assert!(reopened.is_deleted(0));
    assert!(reopened.is_deleted(2));
    assert_eq!(reopened.num_docs(), 1);

    Ok(())
}

#[test]
fn test_write_changes_without_deletions_is_a_noop() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["one"]);

    segment.write_changes()?;
    assert_eq!(segment.del_gen(), -1);
    assert!(!storage.file_exists("_0_1.del"));

    Ok(())
}

#[test]
fn test_concurrent_deletions_are_merged() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["one", "two", "three"]);

    // Another process persists a deletion for doc 0.
    let mut other = reopen(&storage, "_0", 3);
    other.delete(0);
    other.write_changes()?;

    // This process deletes doc 2; writing merges both sets into the next
    // generation.
    segment.delete(2);
    segment.write_changes()?;
    assert_eq!(segment.del_gen(), 2);
    assert!(segment.is_deleted(0));
    assert!(segment.is_deleted(2));

    let reopened = reopen(&storage, "_0", 3);
    assert_eq!(reopened.del_gen(), 2);
    assert_eq!(reopened.num_docs(), 1);

    Ok(())
}

#[test]
fn test_undelete_all() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["one", "two"]);

    segment.delete(0);
    segment.write_changes()?;
    assert_eq!(segment.num_docs(), 1);

    segment.undelete_all();
    assert!(!segment.is_deleted(0));
    assert_eq!(segment.num_docs(), 2);

    segment.write_changes()?;
    let reopened = reopen(&storage, "_0", 2);
    assert!(!reopened.is_deleted(0));
    assert_eq!(reopened.num_docs(), 2);

    Ok(())
}

#[test]
fn test_deleted_docs_are_skipped_by_merge_doc_map() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut segment = build_segment(&storage, "_0", &["aaa", "bbb", "ccc"]);

    segment.delete(1);
    segment.write_changes()?;

    // Postings still cover the deleted doc at the raw layer.
    let mut reopened = reopen(&storage, "_0", 3);
    assert_eq!(reopened.term_docs(&Term::new("body", "bbb"), 0, None)?, vec![1]);
    assert!(reopened.is_deleted(1));

    Ok(())
}

#[test]
fn test_sparse_del_file_decodes_all_runs() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    build_segment(&storage, "_0", &["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
    // Pad the segment to make bits beyond one byte meaningful.

    // Hand-write a sparse 2.1+ delete file with two delta-gap runs:
    // bit 1 of byte 0 (doc 1) and bit 0 of byte 1 (doc 8).
    let mut del = StructWriter::new(storage.create_output("_0_1.del")?);
    del.write_u32(0xFFFF_FFFF)?; // sparse marker
    del.write_u32(10)?; // byte count header
    del.write_u32(2)?; // set bit count
    del.write_vint(0)?; // gap to byte 0
    del.write_byte(0b0000_0010)?;
    del.write_vint(1)?; // gap to byte 1
    del.write_byte(0b0000_0001)?;
    del.close()?;

    // Every run must be decoded, not just the first.
    let reopened = reopen(&storage, "_0", 10);
    assert!(reopened.is_deleted(1));
    assert!(reopened.is_deleted(8));
    assert_eq!(reopened.num_docs(), 8);

    Ok(())
}

#[test]
fn test_deletion_through_index_facade() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;

    for body in ["first", "second", "third"] {
        let mut doc = Document::new();
        doc.add_field(Field::text("body", body));
        index.add_document(&doc)?;
    }
    index.commit()?;
    assert_eq!(index.num_docs(), 3);

    index.delete(1)?;
    index.commit()?;
    assert!(index.is_deleted(1)?);
    assert_eq!(index.num_docs(), 2);
    assert_eq!(index.doc_count(), 3);

    // Reopen sees the persisted deletion.
    index.close()?;
    let reopened = Index::open(Arc::clone(&storage), IndexConfig::default())?;
    assert!(reopened.is_deleted(1)?);
    assert_eq!(reopened.num_docs(), 2);

    Ok(())
}
