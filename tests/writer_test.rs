//! Integration tests for the index writer: buffering, flushes, generation
//! publication and cooperative cleanup.

use std::sync::Arc;

use kontos::document::{Document, Field};
use kontos::error::Result;
use kontos::index::{Index, IndexConfig, Term, lock, segments};
use kontos::storage::{FileStorage, MemoryStorage, Storage, StructReader};
use tempfile::TempDir;

fn doc(body: &str) -> Document {
    let mut doc = Document::new();
    doc.add_field(Field::text("body", body));
    doc
}

#[test]
fn test_25_docs_flush_into_three_segments() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = IndexConfig {
        max_buffered_docs: 10,
        ..Default::default()
    };

    let mut index = Index::create(Arc::clone(&storage), config)?;
    for i in 0..25 {
        index.add_document(&doc(&format!("document number {i}")))?;
    }
    index.commit()?;

    // With the default merge factor nothing qualifies for merging yet:
    // exactly three flushed segments of sizes 10, 10 and 5.
    let mut sizes: Vec<u32> = index.segments().iter().map(|(_, size)| *size).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5, 10, 10]);
    assert_eq!(index.doc_count(), 25);
    assert_eq!(index.num_docs(), 25);

    Ok(())
}

#[test]
fn test_generation_advances_by_one_per_publication() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;

    let start = index.generation();
    index.add_document(&doc("alpha"))?;
    index.commit()?;
    assert_eq!(index.generation(), start + 1);

    index.add_document(&doc("beta"))?;
    index.commit()?;
    assert_eq!(index.generation(), start + 2);

    Ok(())
}

#[test]
fn test_segments_gen_carries_doubled_generation() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;
    index.add_document(&doc("alpha"))?;
    index.commit()?;

    let mut reader = StructReader::new(storage.open_input("segments.gen")?)?;
    assert_eq!(reader.read_u32()?, 0xFFFF_FFFE);
    let gen1 = reader.read_i64()?;
    let gen2 = reader.read_i64()?;
    assert_eq!(gen1, gen2);
    assert_eq!(gen1, index.generation());

    Ok(())
}

#[test]
fn test_documents_survive_reopen() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    {
        let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;
        index.add_document(&doc("persistent content"))?;
        index.commit()?;
        index.close()?;
    }

    let mut index = Index::open(Arc::clone(&storage), IndexConfig::default())?;
    assert_eq!(index.doc_count(), 1);
    assert!(index.has_term(&Term::new("body", "persistent"))?);
    let stored = index.document(0)?;
    assert_eq!(
        stored.field("body").unwrap().value.as_text().unwrap(),
        "persistent content"
    );

    Ok(())
}

#[test]
fn test_cleanup_removes_stale_generations() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;

    index.add_document(&doc("alpha"))?;
    index.commit()?;
    index.add_document(&doc("beta"))?;
    index.commit()?;

    // No other reader is active, so escalation succeeded and only the
    // current generation's segments file remains.
    let segment_files: Vec<String> = storage
        .list_files()?
        .into_iter()
        .filter(|f| f.starts_with("segments_"))
        .collect();
    assert_eq!(
        segment_files,
        vec![segments::segment_file_name(index.generation())]
    );

    Ok(())
}

#[test]
fn test_cleanup_deferred_while_another_process_reads() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;

    index.add_document(&doc("alpha"))?;
    index.commit()?;

    // A concurrent reader pins its generation through the shared lock.
    let concurrent_reader = lock::obtain_read_lock(storage.as_ref())?;

    index.add_document(&doc("beta"))?;
    index.commit()?;

    // Escalation failed, so stale generations were left in place.
    let stale_count = storage
        .list_files()?
        .iter()
        .filter(|f| f.starts_with("segments_"))
        .count();
    assert!(stale_count > 1, "cleanup must be deferred while a reader is active");

    // Once the reader is gone, the next publication cleans up.
    drop(concurrent_reader);
    index.add_document(&doc("gamma"))?;
    index.commit()?;

    let segment_files: Vec<String> = storage
        .list_files()?
        .into_iter()
        .filter(|f| f.starts_with("segments_"))
        .collect();
    assert_eq!(
        segment_files,
        vec![segments::segment_file_name(index.generation())]
    );

    Ok(())
}

#[test]
fn test_file_storage_end_to_end() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp_dir.path())?);

    let mut index = Index::create(Arc::clone(&storage), IndexConfig::default())?;
    for i in 0..5 {
        index.add_document(&doc(&format!("file backed doc {i}")))?;
    }
    index.commit()?;

    assert_eq!(index.doc_count(), 5);
    assert_eq!(index.term_docs(&Term::new("body", "backed"), None)?.len(), 5);
    index.close()?;

    let mut reopened = Index::open(Arc::clone(&storage), IndexConfig::default())?;
    assert_eq!(reopened.doc_count(), 5);
    assert_eq!(
        reopened
            .document(3)?
            .field("body")
            .unwrap()
            .value
            .as_text()
            .unwrap(),
        "file backed doc 3"
    );

    Ok(())
}
