//! Index writer: the top-level mutation path.
//!
//! The writer buffers documents into an in-memory segment, flushes full
//! buffers to disk, publishes new generations of the segments file, runs
//! the tiered auto-merge policy, and performs cooperative file cleanup
//! under the index lock protocol.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::{debug, warn};
use parking_lot::Mutex;
use regex::Regex;

use crate::document::Document;
use crate::error::{KontosError, Result};
use crate::index::config::IndexConfig;
use crate::index::lock;
use crate::index::segment_merger::SegmentMerger;
use crate::index::segment_reader::SegmentReader;
use crate::index::segment_writer::DocumentWriter;
use crate::index::segments::{
    self, FormatVersion, INDEX_EXTENSIONS, SEGMENTS_GEN_MARKER, SegmentEntry, segment_file_name,
};
use crate::storage::{LockFile, Storage, StructReader, StructWriter};
use crate::util::base36;

/// Shared registry of open segment readers, keyed by segment name.
pub type SegmentRegistry = Arc<Mutex<AHashMap<String, SegmentReader>>>;

/// Writes documents and maintains the segment list of an index.
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    segments: SegmentRegistry,
    read_lock: Arc<Mutex<Box<dyn LockFile>>>,
    config: IndexConfig,

    /// Changes counter folded into the index version at publication.
    version_update: u64,

    /// Segments created by this writer, pending publication.
    new_segments: Vec<SegmentReader>,

    /// Segments replaced by a merge, to be dropped at the next publication.
    segments_to_delete: AHashSet<String>,

    /// Current buffered segment accepting documents.
    current_segment: Option<DocumentWriter>,
}

impl IndexWriter {
    /// Open the index for writing.
    ///
    /// `segments` is shared with the owning index so that deletions made
    /// through its readers are persisted at the next publication, and
    /// `read_lock` is the shared read lock the owning process holds.
    pub fn new(
        storage: Arc<dyn Storage>,
        segments: SegmentRegistry,
        read_lock: Arc<Mutex<Box<dyn LockFile>>>,
        config: IndexConfig,
    ) -> Self {
        IndexWriter {
            storage,
            segments,
            read_lock,
            config,
            version_update: 0,
            new_segments: Vec::new(),
            segments_to_delete: AHashSet::new(),
            current_segment: None,
        }
    }

    /// Create an empty index.
    ///
    /// See [`segments::create_index`] for the generation-dependent layout.
    pub fn create_index(storage: &dyn Storage, generation: i64, name_counter: u32) -> Result<()> {
        segments::create_index(storage, generation, name_counter)
    }

    /// Add a document to the index.
    ///
    /// A full buffer is flushed into a new segment, and every call gives
    /// the tiered merge policy a chance to run.
    pub fn add_document(&mut self, document: &Document) -> Result<()> {
        if self.current_segment.is_none() {
            let name = self.new_segment_name()?;
            self.current_segment = Some(DocumentWriter::new(
                Arc::clone(&self.storage),
                &name,
                &self.config,
            ));
        }

        self.current_segment
            .as_mut()
            .expect("created above")
            .add_document(document)?;

        if self.current_segment.as_ref().expect("created above").count()
            >= self.config.max_buffered_docs
        {
            self.commit()?;
        }

        self.maybe_merge_segments()?;

        self.version_update += 1;
        Ok(())
    }

    /// Allocate a name for a new segment.
    ///
    /// The name counter lives at a fixed offset of the current segments
    /// file and is incremented in place under the write lock, so names are
    /// unique across processes.
    pub fn new_segment_name(&mut self) -> Result<String> {
        let mut write_lock = lock::obtain_write_lock(self.storage.as_ref())?;

        let result = (|| -> Result<String> {
            let generation = segments::actual_generation(self.storage.as_ref())?;
            if generation < 0 {
                return Err(KontosError::index("Index doesn't exist in the directory"));
            }
            let file_name = segment_file_name(generation);

            // 12 = 4 (format marker) + 8 (index version).
            let mut reader = StructReader::new(self.storage.open_input(&file_name)?)?;
            reader.seek_to(12)?;
            let segment_name_counter = reader.read_u32()?;

            let mut patcher = StructWriter::new(self.storage.open_output(&file_name)?);
            patcher.seek_to(12)?;
            patcher.write_u32(segment_name_counter + 1)?;
            // Flush so a stale counter cannot be read between unlock and
            // the writer handle going away.
            patcher.close()?;

            Ok(format!("_{}", base36::encode(segment_name_counter as u64)))
        })();

        write_lock.unlock()?;
        result
    }

    /// Commit current changes.
    ///
    /// Closes the buffered segment (if any) into the pending set and
    /// publishes a new generation.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(current) = self.current_segment.take()
            && let Some(new_segment) = current.close()?
        {
            debug!(
                "flushed segment '{}' ({} docs)",
                new_segment.name(),
                new_segment.count()
            );
            self.new_segments.push(new_segment);
        }

        self.update_segments()
    }

    /// Publish a new generation of the segments file.
    ///
    /// Under the exclusive write lock: persists deletion changes, copies
    /// every still-live segment's metadata forward into `segments_<N+1>`,
    /// appends newly created segments, and moves the generation pointer.
    /// Afterwards attempts read-lock escalation; if no other process is
    /// reading, obsolete files are physically deleted, otherwise cleanup
    /// is deferred.
    pub fn update_segments(&mut self) -> Result<()> {
        let mut write_lock = lock::obtain_write_lock(self.storage.as_ref())?;

        let published = self.publish_generation();
        let (generation, live_segments) = match published {
            Ok(result) => result,
            Err(error) => {
                let _ = write_lock.unlock();
                return Err(error);
            }
        };

        // Check whether another update or read process is running now; if
        // so, skip the clean-up procedure.
        let cleanup = (|| -> Result<()> {
            let mut read_lock = self.read_lock.lock();
            if lock::escalate_read_lock(self.storage.as_ref(), read_lock.as_mut())? {
                self.clean_up_directory(generation, &live_segments)?;
                lock::de_escalate_read_lock(read_lock.as_mut())?;
            } else {
                // Another process is reading; only release in-process file
                // handles for files known to be obsolete.
                for name in &self.segments_to_delete {
                    for extension in INDEX_EXTENSIONS {
                        self.storage.purge_file(&format!("{name}{extension}"));
                    }
                }
            }
            Ok(())
        })();

        self.segments_to_delete.clear();
        write_lock.unlock()?;
        cleanup?;

        // Remove unused segments from the registry.
        self.segments
            .lock()
            .retain(|name, _| live_segments.contains_key(name));

        Ok(())
    }

    /// Write the next generation's segments file, rolling the generation
    /// pointer back on failure.
    fn publish_generation(&mut self) -> Result<(i64, AHashMap<String, u32>)> {
        {
            // Write down deletion changes for the tracked segments.
            let mut registry = self.segments.lock();
            for segment in registry.values_mut() {
                segment.write_changes()?;
            }
        }

        let generation = segments::actual_generation(self.storage.as_ref())?;
        if generation < 0 {
            return Err(KontosError::index("Index doesn't exist in the directory"));
        }
        let new_generation = generation + 1;

        let mut gen_file = StructWriter::new(self.storage.open_output("segments.gen")?);
        gen_file.write_u32(SEGMENTS_GEN_MARKER)?;
        // Write generation (first copy).
        gen_file.write_i64(new_generation)?;
        gen_file.flush()?;

        match self.write_segments_file(generation, new_generation) {
            Ok(live_segments) => {
                // Write generation (second copy).
                gen_file.write_i64(new_generation)?;
                gen_file.close()?;

                debug!(
                    "published generation {} ({} segments)",
                    new_generation,
                    live_segments.len()
                );
                Ok((new_generation, live_segments))
            }
            Err(error) => {
                // Restore the previous index generation; readers must
                // never observe a generation without a fully written
                // segments file.
                gen_file.seek_to(4)?;
                let _ = gen_file.write_i64(generation);
                let _ = gen_file.write_i64(generation);
                let _ = gen_file.close();
                Err(error)
            }
        }
    }

    fn write_segments_file(
        &mut self,
        generation: i64,
        new_generation: i64,
    ) -> Result<AHashMap<String, u32>> {
        if self.config.target_format == FormatVersion::Pre21 {
            return Err(KontosError::invalid_argument(
                "Writing pre-2.1 segments files is not supported",
            ));
        }

        let source = segments::read_segments_file_at(self.storage.as_ref(), generation)?;
        let mut out = StructWriter::new(
            self.storage
                .create_output(&segment_file_name(new_generation))?,
        );

        out.write_u32(self.config.target_format.marker())?;
        out.write_u64(source.version + self.version_update)?;
        self.version_update = 0;
        out.write_u32(source.name_counter)?;

        let segments_count_offset = out.tell();
        out.write_u32(0)?; // patched below

        let mut live_segments = AHashMap::new();
        let mut registry = self.segments.lock();

        for mut entry in source.segments {
            if self.segments_to_delete.contains(&entry.name) {
                continue;
            }

            if let Some(segment) = registry.get(&entry.name) {
                // Carry the actual delete generation forward.
                entry.del_gen = segment.del_gen();
            } else {
                let segment = SegmentReader::open(
                    Arc::clone(&self.storage),
                    &entry.name,
                    entry.doc_count,
                    entry.del_gen,
                    entry.doc_store.clone(),
                    entry.has_single_norm_file,
                    entry.is_compound(),
                )?;
                registry.insert(entry.name.clone(), segment);
            }

            entry.write(&mut out, self.config.target_format)?;
            live_segments.insert(entry.name.clone(), entry.doc_count);
        }

        for segment in self.new_segments.drain(..) {
            let entry = SegmentEntry {
                name: segment.name().to_string(),
                doc_count: segment.count(),
                // There is no delete file yet.
                del_gen: -1,
                doc_store: None,
                has_single_norm_file: segment.has_single_norm_file(),
                norm_gens: Vec::new(),
                is_compound_byte: if segment.is_compound() { 0x01 } else { 0xFF },
            };
            entry.write(&mut out, self.config.target_format)?;

            live_segments.insert(segment.name().to_string(), segment.count());
            registry.insert(segment.name().to_string(), segment);
        }

        let total = live_segments.len() as u32;
        out.seek_to(segments_count_offset)?;
        out.write_u32(total)?;
        out.close()?;

        Ok(live_segments)
    }

    /// Physically delete every file no generation references.
    ///
    /// Files are ordered least-consequential first: the legacy `deletable`
    /// file, the pre-2.1 `segments` file, outdated `segments_<N>` files,
    /// orphaned per-segment files, and finally obsolete delete-file
    /// generations (keeping the most recent generation per segment).
    fn clean_up_directory(
        &self,
        generation: i64,
        live_segments: &AHashMap<String, u32>,
    ) -> Result<()> {
        let segments_pattern = Regex::new(r"^segments_[0-9a-zA-Z]+$").expect("static regex");
        let norm_pattern = Regex::new(r"^(_([0-9a-zA-Z]+))\.f\d+$").expect("static regex");
        let del_pattern =
            Regex::new(r"^(_([0-9a-zA-Z]+))_([0-9a-zA-Z]+)\.del$").expect("static regex");

        let current_segments_file = segment_file_name(generation);
        let buffered_name = self.current_segment.as_ref().map(|s| s.name().to_string());

        // (file, type, number): sorted by type, then number, then name.
        let mut candidates: Vec<(String, u8, u64)> = Vec::new();
        // Delete files of live segments: per segment number, generation ->
        // file name. Only the latest generation survives.
        let mut del_files: AHashMap<u64, Vec<(u64, String)>> = AHashMap::new();

        for file in self.storage.list_files()? {
            if file == "deletable" {
                // Not used starting from the 2.1 format.
                candidates.push((file, 0, 0));
            } else if file == "segments" {
                // "Zero" version of the segments file.
                candidates.push((file, 1, 0));
            } else if segments_pattern.is_match(&file) {
                if file != current_segments_file {
                    let number = base36::decode(&file[9..]).unwrap_or(0);
                    candidates.push((file, 2, number));
                }
            } else if let Some(captures) = norm_pattern.captures(&file) {
                // Legacy per-field norm file.
                if !live_segments.contains_key(&captures[1]) {
                    let number = base36::decode(&captures[2]).unwrap_or(0);
                    candidates.push((file.clone(), 3, number));
                }
            } else if let Some(captures) = del_pattern.captures(&file) {
                let segment_name = captures[1].to_string();
                let segment_number = base36::decode(&captures[2]).unwrap_or(0);
                if !live_segments.contains_key(&segment_name) {
                    candidates.push((file.clone(), 3, segment_number));
                } else {
                    let del_generation = base36::decode(&captures[3]).unwrap_or(0);
                    del_files
                        .entry(segment_number)
                        .or_default()
                        .push((del_generation, file.clone()));
                }
            } else if file.len() >= 4 && INDEX_EXTENSIONS.contains(&&file[file.len() - 4..]) {
                let segment_name = &file[..file.len() - 4];
                if !live_segments.contains_key(segment_name)
                    && buffered_name.as_deref() != Some(segment_name)
                {
                    let number = segment_name
                        .strip_prefix('_')
                        .and_then(|n| base36::decode(n).ok())
                        .unwrap_or(0);
                    candidates.push((file.clone(), 3, number));
                }
            }
        }

        // For live segments, every delete generation but the newest is a
        // candidate; order candidates by (segment number, generation).
        let mut max_generation = 0u64;
        for generations in del_files.values_mut() {
            generations.sort();
            generations.pop(); // keep the most recent delete generation
            if let Some((last, _)) = generations.last() {
                max_generation = max_generation.max(*last);
            }
        }
        for (segment_number, generations) in &del_files {
            for (del_generation, file) in generations {
                candidates.push((
                    file.clone(),
                    4,
                    segment_number * max_generation + del_generation,
                ));
            }
        }

        candidates.sort_by(|a, b| (a.1, a.2, &a.0).cmp(&(b.1, b.2, &b.0)));

        for (file, _, _) in candidates {
            // Shared doc store members may still be referenced by other
            // segments; skip them.
            if file.ends_with(".cfx") {
                continue;
            }
            if let Err(error) = self.storage.delete_file(&file) {
                // The file may be held open elsewhere; it will be caught
                // by a later cleanup cycle.
                warn!("couldn't delete '{file}': {error}");
            }
        }

        Ok(())
    }

    /// Merge segments if the tiered policy calls for it.
    ///
    /// Skips entirely when another process holds the optimization lock.
    pub fn maybe_merge_segments(&mut self) -> Result<()> {
        let Some(mut optimization_lock) =
            lock::obtain_optimization_lock(self.storage.as_ref())?
        else {
            return Ok(());
        };

        let result = (|| -> Result<()> {
            if !self.has_anything_to_merge() {
                return Ok(());
            }

            // Refresh the segments list so no segment merged by another
            // process is merged again. Merging is serialized by the
            // optimization lock, so only new segments can be added to the
            // index while this runs.
            self.update_segments()?;

            let mut sizes: Vec<(String, u32)> = self
                .segments
                .lock()
                .iter()
                .map(|(name, segment)| (name.clone(), segment.count()))
                .collect();
            sizes.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

            let mut merge_pool: Vec<String> = Vec::new();
            let mut pool_size = 0u64;
            let mut size_to_merge = self.config.max_buffered_docs as u64;

            for (name, size) in sizes {
                // Check if the segment falls into a new merging block.
                while size as u64 >= size_to_merge {
                    // Merge the previous block if it's large enough.
                    if pool_size >= size_to_merge {
                        self.merge_segments(&merge_pool)?;
                    }
                    merge_pool.clear();
                    pool_size = 0;

                    size_to_merge *= self.config.merge_factor as u64;

                    if size_to_merge > self.config.max_merge_docs as u64 {
                        return Ok(());
                    }
                }

                merge_pool.push(name);
                pool_size += size as u64;
            }

            if pool_size >= size_to_merge {
                self.merge_segments(&merge_pool)?;
            }

            Ok(())
        })();

        optimization_lock.unlock()?;
        result
    }

    /// Check whether the tiered policy has anything to merge.
    fn has_anything_to_merge(&self) -> bool {
        let mut sizes: Vec<u32> = self
            .segments
            .lock()
            .values()
            .map(|segment| segment.count())
            .collect();
        sizes.sort_unstable();

        let mut pool_size = 0u64;
        let mut size_to_merge = self.config.max_buffered_docs as u64;

        for size in sizes {
            while size as u64 >= size_to_merge {
                if pool_size >= size_to_merge {
                    return true;
                }
                pool_size = 0;

                size_to_merge *= self.config.merge_factor as u64;

                if size_to_merge > self.config.max_merge_docs as u64 {
                    return false;
                }
            }

            pool_size += size as u64;
        }

        pool_size >= size_to_merge
    }

    /// Merge the named segments into one new segment.
    fn merge_segments(&mut self, names: &[String]) -> Result<()> {
        let new_name = self.new_segment_name()?;

        for name in names {
            self.segments_to_delete.insert(name.clone());
        }

        let merged = {
            let segments = Arc::clone(&self.segments);
            let mut registry = segments.lock();

            let mut merger =
                SegmentMerger::new(Arc::clone(&self.storage), &new_name, &self.config);
            for (name, segment) in registry.iter_mut() {
                if names.contains(name) {
                    merger.add_source(segment);
                }
            }
            merger.merge()?
        };

        if let Some(segment) = merged {
            self.new_segments.push(segment);
        }

        self.commit()
    }

    /// Merge every current segment into one, regardless of tiering.
    ///
    /// Returns `false` when another optimization or auto-merge process is
    /// running.
    pub fn optimize(&mut self) -> Result<bool> {
        let Some(mut optimization_lock) =
            lock::obtain_optimization_lock(self.storage.as_ref())?
        else {
            return Ok(false);
        };

        let result = (|| -> Result<()> {
            self.update_segments()?;

            let names: Vec<String> = self.segments.lock().keys().cloned().collect();
            if names.is_empty() {
                return Ok(());
            }
            self.merge_segments(&names)
        })();

        optimization_lock.unlock()?;
        result?;

        Ok(true)
    }
}
