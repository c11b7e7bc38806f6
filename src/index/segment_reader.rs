//! Segment reader: opens one immutable segment and exposes term lookup,
//! postings iteration, deletions, norms, stored documents, and a stream
//! protocol for ordered term enumeration.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use regex::Regex;

use crate::document::{Document, Field, FieldValue};
use crate::error::{KontosError, Result};
use crate::index::deletions::DeletionSet;
use crate::index::dictionary::{self, DictionaryIndex};
use crate::index::docs_filter::DocsFilter;
use crate::index::field_info::FieldInfo;
use crate::index::segments::DocStoreOptions;
use crate::index::term::{Term, TermInfo, prefix_by_chars};
use crate::search::similarity;
use crate::storage::{Storage, StructReader};
use crate::util::base36;

/// "Full scan vs fetch" boundary.
///
/// If filter selectivity is below this value a full scan is performed,
/// since fetching term entries has some additional overhead. Both paths
/// currently share one decode loop, so the boundary is a tuning point for
/// future skip-data support rather than a behavioral switch.
pub const FULL_SCAN_VS_FETCH_BOUNDARY: u32 = 5;

/// Delete generation sentinel: autodetect the latest generation on disk.
pub const DETECT_LATEST_DEL_GEN: i64 = -2;

const TERM_INFO_CACHE_SIZE: usize = 1024;
const TERM_INFO_CACHE_EVICT_TO: usize = 768;

/// Terms scan modes for the terms stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Terms are scanned, no additional info is retrieved.
    #[default]
    TermsOnly,
    /// Terms are scanned, frequency and position info is retrieved.
    FullInfo,
    /// Like full info, but document numbers are compacted (shifted if the
    /// segment has deleted documents).
    MergeInfo,
}

/// An iterator protocol over a whole term dictionary in (field, text) order.
pub trait TermsStream {
    /// Reset the terms stream to the first term.
    fn reset_terms_stream(&mut self) -> Result<()>;

    /// Skip the stream forward until the current term is `>= prefix`.
    ///
    /// The prefix contains fully specified field info and a portion of the
    /// searched term.
    fn skip_to(&mut self, prefix: &Term) -> Result<()>;

    /// Advance to and return the next term.
    fn next_term(&mut self) -> Result<Option<Term>>;

    /// The term at the current position.
    fn current_term(&self) -> Option<&Term>;

    /// Release stream resources without reading to the end.
    fn close_terms_stream(&mut self);
}

/// Cache of term lookups, capacity 1024.
///
/// Hits refresh recency; once the cache fills, the 256 stalest entries are
/// evicted in one batch, leaving 768.
#[derive(Debug, Default)]
struct TermInfoCache {
    map: AHashMap<Vec<u8>, (u64, Option<TermInfo>)>,
    order: VecDeque<(u64, Vec<u8>)>,
    stamp: u64,
}

impl TermInfoCache {
    fn get(&mut self, key: &[u8]) -> Option<Option<TermInfo>> {
        if let Some((entry_stamp, value)) = self.map.get_mut(key) {
            self.stamp += 1;
            *entry_stamp = self.stamp;
            let result = value.clone();
            self.order.push_back((self.stamp, key.to_vec()));
            return Some(result);
        }
        None
    }

    fn insert(&mut self, key: Vec<u8>, value: Option<TermInfo>) {
        self.stamp += 1;
        self.map.insert(key.clone(), (self.stamp, value));
        self.order.push_back((self.stamp, key));

        if self.map.len() >= TERM_INFO_CACHE_SIZE {
            while self.map.len() > TERM_INFO_CACHE_EVICT_TO {
                let Some((stamp, key)) = self.order.pop_front() else {
                    break;
                };
                // Stale order entries are skipped; only the freshest stamp
                // of a key represents it.
                if self.map.get(&key).is_some_and(|(current, _)| *current == stamp) {
                    self.map.remove(&key);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Shared doc store state resolved at open time.
#[derive(Debug, Clone)]
struct SharedDocStore {
    options: DocStoreOptions,
    files: AHashMap<String, u64>,
    file_sizes: AHashMap<String, u64>,
}

/// Reader for one index segment.
#[derive(Debug)]
pub struct SegmentReader {
    storage: Arc<dyn Storage>,
    name: String,
    doc_count: u32,
    del_gen: i64,
    has_single_norm_file: bool,
    is_compound: bool,

    /// Compound file member offsets and sizes, keyed by member file name.
    seg_files: AHashMap<String, u64>,
    seg_file_sizes: AHashMap<String, u64>,
    shared_doc_store: Option<SharedDocStore>,

    fields: Vec<FieldInfo>,
    /// Translation from field number to its alphabetical rank.
    fields_dic_positions: Vec<usize>,

    norms: AHashMap<u32, Vec<u8>>,
    deleted: Option<DeletionSet>,
    deleted_dirty: bool,

    term_info_cache: TermInfoCache,
    dictionary: Option<DictionaryIndex>,

    // Terms stream state.
    tis_stream: Option<StructReader>,
    frq_stream: Option<StructReader>,
    prx_stream: Option<StructReader>,
    stream_term_count: u64,
    stream_term_num: u64,
    stream_index_interval: u32,
    stream_skip_interval: u32,
    stream_mode: ScanMode,
    stream_last_field_num: i32,
    stream_last_text: String,
    stream_last_info: TermInfo,
    doc_map: Option<Vec<Option<u32>>>,
    current: Option<Term>,
    current_positions: Option<BTreeMap<u32, Vec<u32>>>,
}

impl SegmentReader {
    /// Open a segment.
    ///
    /// `del_gen` of [`DETECT_LATEST_DEL_GEN`] autodetects the latest delete
    /// generation by scanning the directory; `is_compound` of `None`
    /// detects compound layout from the presence of a `.cfs` file.
    pub fn open(
        storage: Arc<dyn Storage>,
        name: &str,
        doc_count: u32,
        del_gen: i64,
        doc_store: Option<DocStoreOptions>,
        has_single_norm_file: bool,
        is_compound: Option<bool>,
    ) -> Result<Self> {
        let shared_doc_store = match doc_store {
            Some(options) if options.is_compound => {
                let cfx_name = format!("{}.cfx", options.segment);
                let (files, file_sizes) = Self::read_compound_table(storage.as_ref(), &cfx_name)?;
                Some(SharedDocStore {
                    options,
                    files,
                    file_sizes,
                })
            }
            Some(options) => Some(SharedDocStore {
                options,
                files: AHashMap::new(),
                file_sizes: AHashMap::new(),
            }),
            None => None,
        };

        let is_compound = match is_compound {
            Some(value) => value,
            // Pre-2.1 segment, or compound state marked unknown: detect
            // from the directory.
            None => storage.file_exists(&format!("{name}.cfs")),
        };

        let (seg_files, seg_file_sizes) = if is_compound {
            Self::read_compound_table(storage.as_ref(), &format!("{name}.cfs"))?
        } else {
            (AHashMap::new(), AHashMap::new())
        };

        let mut reader = SegmentReader {
            storage,
            name: name.to_string(),
            doc_count,
            del_gen,
            has_single_norm_file,
            is_compound,
            seg_files,
            seg_file_sizes,
            shared_doc_store,
            fields: Vec::new(),
            fields_dic_positions: Vec::new(),
            norms: AHashMap::new(),
            deleted: None,
            deleted_dirty: false,
            term_info_cache: TermInfoCache::default(),
            dictionary: None,
            tis_stream: None,
            frq_stream: None,
            prx_stream: None,
            stream_term_count: 0,
            stream_term_num: 0,
            stream_index_interval: 0,
            stream_skip_interval: 0,
            stream_mode: ScanMode::TermsOnly,
            stream_last_field_num: -1,
            stream_last_text: String::new(),
            stream_last_info: TermInfo::new(0, 0, 0, 0),
            doc_map: None,
            current: None,
            current_positions: None,
        };

        reader.read_field_infos()?;

        if reader.del_gen == DETECT_LATEST_DEL_GEN {
            // Invoked from the index writer; the write lock is already
            // held, so the scan is race-free.
            reader.del_gen = reader.detect_latest_del_gen()?;
        }
        reader.deleted = reader.load_del_file()?;

        Ok(reader)
    }

    fn read_compound_table(
        storage: &dyn Storage,
        file_name: &str,
    ) -> Result<(AHashMap<String, u64>, AHashMap<String, u64>)> {
        let total_length = storage.file_size(file_name)?;
        let mut reader = StructReader::new(storage.open_input(file_name)?)?;

        let count = reader.read_vint()?;
        let mut entries: Vec<(String, u64)> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let data_offset = reader.read_u64()?;
            let member_name = reader.read_string()?;
            entries.push((member_name, data_offset));
        }

        let mut files = AHashMap::new();
        let mut file_sizes = AHashMap::new();
        for (idx, (member_name, data_offset)) in entries.iter().enumerate() {
            let end = entries
                .get(idx + 1)
                .map(|(_, next_offset)| *next_offset)
                .unwrap_or(total_length);
            files.insert(member_name.clone(), *data_offset);
            file_sizes.insert(member_name.clone(), end - data_offset);
        }

        Ok((files, file_sizes))
    }

    fn read_field_infos(&mut self) -> Result<()> {
        let mut fnm = self.open_compound_file(".fnm")?;
        let field_count = fnm.read_vint()?;

        for number in 0..field_count {
            let field_name = fnm.read_string()?;
            let bits = fnm.read_byte()?;
            let field = FieldInfo::from_flag_bits(field_name, number, bits);

            if field.norms_omitted {
                // Norms are omitted for the indexed field.
                self.norms.insert(
                    number,
                    vec![similarity::encode_norm(1.0); self.doc_count as usize],
                );
            }

            self.fields.push(field);
        }

        // Term dictionaries order fields by name; build the translation
        // table from field number to its rank.
        let mut numbers: Vec<u32> = (0..field_count).collect();
        numbers.sort_by(|a, b| self.fields[*a as usize].name.cmp(&self.fields[*b as usize].name));
        self.fields_dic_positions = vec![0; field_count as usize];
        for (rank, number) in numbers.iter().enumerate() {
            self.fields_dic_positions[*number as usize] = rank;
        }

        Ok(())
    }

    /// Open an index file that may be stored within the compound segment
    /// file, returning a windowed reader whose position 0 is the file's
    /// first byte.
    pub(crate) fn open_compound_file(&self, extension: &str) -> Result<StructReader> {
        if (extension == ".fdx" || extension == ".fdt")
            && let Some(store) = &self.shared_doc_store
        {
            return self.open_shared_doc_store_file(store, extension);
        }

        let file_name = format!("{}{extension}", self.name);

        if !self.is_compound {
            return StructReader::new(self.storage.open_input(&file_name)?);
        }

        let offset = *self.seg_files.get(&file_name).ok_or_else(|| {
            KontosError::invalid_file_format(format!(
                "Segment compound file doesn't contain {file_name} file"
            ))
        })?;
        let length = self.seg_file_sizes[&file_name];

        StructReader::window(
            self.storage.open_input(&format!("{}.cfs", self.name))?,
            offset,
            length,
        )
    }

    fn open_shared_doc_store_file(
        &self,
        store: &SharedDocStore,
        extension: &str,
    ) -> Result<StructReader> {
        let fdx_name = format!("{}.fdx", store.options.segment);
        let fdt_name = format!("{}.fdt", store.options.segment);
        let doc_offset = store.options.offset as u64 * 8;

        if !store.options.is_compound {
            if extension == ".fdx" {
                let input = self.storage.open_input(&fdx_name)?;
                let size = input.size()?;
                return StructReader::window(input, doc_offset, size - doc_offset);
            }

            let mut fdx = StructReader::new(self.storage.open_input(&fdx_name)?)?;
            fdx.seek_to(doc_offset)?;
            let fdt_start = fdx.read_u64()?;

            let mut fdt = StructReader::new(self.storage.open_input(&fdt_name)?)?;
            fdt.seek_to(fdt_start)?;
            return Ok(fdt);
        }

        let cfx_name = format!("{}.cfx", store.options.segment);
        let fdx_offset = *store.files.get(&fdx_name).ok_or_else(|| {
            KontosError::invalid_file_format(format!(
                "Shared doc storage compound file doesn't contain {fdx_name} file"
            ))
        })?;
        let fdt_offset = *store.files.get(&fdt_name).ok_or_else(|| {
            KontosError::invalid_file_format(format!(
                "Shared doc storage compound file doesn't contain {fdt_name} file"
            ))
        })?;

        if extension == ".fdx" {
            return StructReader::window(
                self.storage.open_input(&cfx_name)?,
                fdx_offset + doc_offset,
                store.file_sizes[&fdx_name] - doc_offset,
            );
        }

        let mut fdx = StructReader::window(
            self.storage.open_input(&cfx_name)?,
            fdx_offset + doc_offset,
            store.file_sizes[&fdx_name] - doc_offset,
        )?;
        let fdt_start = fdx.read_u64()?;

        let mut fdt = StructReader::window(
            self.storage.open_input(&cfx_name)?,
            fdt_offset,
            store.file_sizes[&fdt_name],
        )?;
        fdt.seek_to(fdt_start)?;
        Ok(fdt)
    }

    // ----- deletions -------------------------------------------------------

    /// Detect the latest delete file generation for this segment.
    fn detect_latest_del_gen(&self) -> Result<i64> {
        let pattern = Regex::new(&format!(
            "(?i)^{}_([0-9a-z]+)\\.del$",
            regex::escape(&self.name)
        ))
        .expect("escaped segment name regex");

        let legacy_name = format!("{}.del", self.name);
        let mut latest: i64 = -1;
        for file in self.storage.list_files()? {
            if file == legacy_name {
                latest = latest.max(0);
            } else if let Some(captures) = pattern.captures(&file) {
                latest = latest.max(base36::decode(&captures[1])? as i64);
            }
        }

        Ok(latest)
    }

    fn load_del_file(&mut self) -> Result<Option<DeletionSet>> {
        match self.del_gen {
            -1 => Ok(None),
            0 => self.load_pre21_del_file(),
            _ => self.load_21_del_file(),
        }
    }

    /// Load a pre-2.1 format delete file: bit capacity, set-bit count, raw
    /// bitmap bytes.
    fn load_pre21_del_file(&mut self) -> Result<Option<DeletionSet>> {
        let file_name = format!("{}.del", self.name);
        if !self.storage.file_exists(&file_name) {
            // A missing delete file means "no deletions".
            self.del_gen = -1;
            return Ok(None);
        }

        let mut reader = StructReader::new(self.storage.open_input(&file_name)?)?;
        let bit_capacity = reader.read_u32()?;
        let byte_count = bit_capacity.div_ceil(8) as usize;
        let bit_count = reader.read_u32()?;

        let set = if bit_count == 0 {
            DeletionSet::new()
        } else {
            DeletionSet::from_bitmap(&reader.read_bytes(byte_count)?)
        };

        Ok((!set.is_empty()).then_some(set))
    }

    /// Load a 2.1+ format delete file: either a full bitmap or a sparse
    /// list of delta-gap runs, selected by the leading format integer.
    ///
    /// All sparse runs are decoded up to end of file. (The engine this
    /// format originates from stops after the first run, silently dropping
    /// later deletions; that is a defect, not a format property.)
    fn load_21_del_file(&mut self) -> Result<Option<DeletionSet>> {
        let file_name = format!(
            "{}_{}.del",
            self.name,
            base36::encode(self.del_gen as u64)
        );
        let mut reader = StructReader::new(self.storage.open_input(&file_name)?)?;

        let format = reader.read_u32()?;
        let set = if format == 0xFFFF_FFFF {
            let _byte_count = reader.read_u32()?;
            let _bit_count = reader.read_u32()?;

            let mut set = DeletionSet::new();
            let mut byte_num = 0u32;
            while reader.tell() < reader.length() {
                let dgap = reader.read_vint()?;
                let non_zero_byte = reader.read_byte()?;
                byte_num += dgap;
                set.apply_sparse_run(byte_num, non_zero_byte);
            }
            set
        } else {
            // The format integer is actually the bit capacity.
            let byte_count = format.div_ceil(8) as usize;
            let bit_count = reader.read_u32()?;

            if bit_count == 0 {
                DeletionSet::new()
            } else {
                DeletionSet::from_bitmap(&reader.read_bytes(byte_count)?)
            }
        };

        Ok((!set.is_empty()).then_some(set))
    }

    /// Delete a document by its local id.
    pub fn delete(&mut self, id: u32) {
        self.deleted_dirty = true;
        self.deleted.get_or_insert_with(DeletionSet::new).insert(id);
    }

    /// Drop all deletions.
    ///
    /// The next [`SegmentReader::write_changes`] persists an empty bitmap
    /// as a new delete generation.
    pub fn undelete_all(&mut self) {
        if self.deleted.is_some() {
            self.deleted = None;
            self.deleted_dirty = true;
        }
    }

    /// Check whether a document is deleted.
    pub fn is_deleted(&self, id: u32) -> bool {
        self.deleted.as_ref().is_some_and(|set| set.contains(id))
    }

    /// Whether any documents have been deleted from this segment.
    pub fn has_deletions(&self) -> bool {
        self.deleted.is_some()
    }

    fn deleted_count(&self) -> u32 {
        self.deleted.as_ref().map_or(0, |set| set.len() as u32)
    }

    /// Total number of documents, including deleted ones.
    pub fn count(&self) -> u32 {
        self.doc_count
    }

    /// Number of non-deleted documents.
    pub fn num_docs(&self) -> u32 {
        self.doc_count - self.deleted_count()
    }

    /// Current delete file generation.
    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the segment stores one `.nrm` file for all fields.
    pub fn has_single_norm_file(&self) -> bool {
        self.has_single_norm_file
    }

    /// Whether the segment uses a compound file.
    pub fn is_compound(&self) -> bool {
        self.is_compound
    }

    /// Persist deletion changes if necessary.
    ///
    /// Must only be invoked while the index write lock is held. Merges
    /// local deletions with any generation a concurrent process published,
    /// then writes the union as the next delete generation.
    pub fn write_changes(&mut self) -> Result<()> {
        let latest_del_gen = self.detect_latest_del_gen()?;

        if !self.deleted_dirty {
            // No deletions by the current process.
            if latest_del_gen == self.del_gen {
                return Ok(());
            }

            if latest_del_gen > self.del_gen {
                // The delete file was updated by a concurrent process;
                // reload it.
                self.del_gen = latest_del_gen;
                self.deleted = self.load_del_file()?;
                return Ok(());
            }

            return Err(KontosError::index(format!(
                "Delete file processing workflow is corrupted for the segment '{}'",
                self.name
            )));
        }

        if latest_del_gen > self.del_gen {
            // Merge current deletions with the latest delete file.
            self.del_gen = latest_del_gen;
            if let Some(latest) = self.load_del_file()? {
                self.deleted.get_or_insert_with(DeletionSet::new).union(&latest);
            }
        }

        let set = self.deleted.clone().unwrap_or_default();
        let bitmap = set.to_bitmap(self.doc_count);

        self.del_gen = if self.del_gen == -1 { 1 } else { self.del_gen + 1 };

        let file_name = format!(
            "{}_{}.del",
            self.name,
            base36::encode(self.del_gen as u64)
        );
        let mut del_file =
            crate::storage::StructWriter::new(self.storage.create_output(&file_name)?);
        del_file.write_u32(self.doc_count)?;
        del_file.write_u32(set.len() as u32)?;
        del_file.write_bytes(&bitmap)?;
        del_file.close()?;

        debug!(
            "segment {}: wrote delete generation {} ({} deletions)",
            self.name,
            self.del_gen,
            set.len()
        );

        self.deleted_dirty = false;
        Ok(())
    }

    // ----- fields ----------------------------------------------------------

    /// Field info for the given field number.
    pub fn field(&self, field_num: u32) -> Option<&FieldInfo> {
        self.fields.get(field_num as usize)
    }

    /// All field infos, in field-number order.
    pub fn field_infos(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Field names, optionally restricted to indexed fields.
    pub fn field_names(&self, indexed_only: bool) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| !indexed_only || f.is_indexed)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Field number for a name, or -1 if the field is not in this segment.
    pub fn get_field_num(&self, field_name: &str) -> i32 {
        self.fields
            .iter()
            .find(|f| f.name == field_name)
            .map_or(-1, |f| f.number as i32)
    }

    /// Position of a field in the name-ordered dictionary.
    ///
    /// Values outside the translation table pass through unchanged.
    fn field_position(&self, field_num: i32) -> i32 {
        if field_num >= 0 && (field_num as usize) < self.fields_dic_positions.len() {
            self.fields_dic_positions[field_num as usize] as i32
        } else {
            field_num
        }
    }

    // ----- term lookup -----------------------------------------------------

    fn load_dictionary_index(&mut self) -> Result<()> {
        if self.dictionary.is_some() {
            return Ok(());
        }

        let sti_name = format!("{}.sti", self.name);
        if self.storage.file_exists(&sti_name) {
            // Load the serialized dictionary index.
            let mut sti = StructReader::new(self.storage.open_input(&sti_name)?)?;
            let bytes = sti.read_bytes(sti.length() as usize)?;
            if let Ok(index) = bincode::deserialize::<DictionaryIndex>(&bytes) {
                self.dictionary = Some(index);
                return Ok(());
            }
            // Corrupt cache: fall through and rebuild from the .tii file.
        }

        let mut tii = self.open_compound_file(".tii")?;
        let index = dictionary::load(&mut tii)?;

        let bytes = bincode::serialize(&index)
            .map_err(|e| KontosError::index(format!("Can't serialize dictionary index: {e}")))?;
        let mut sti = crate::storage::StructWriter::new(self.storage.create_output(&sti_name)?);
        sti.write_bytes(&bytes)?;
        sti.close()?;

        self.dictionary = Some(index);
        Ok(())
    }

    /// Look up a term's dictionary record.
    ///
    /// Consults the lookup cache, then binary-searches the sampled
    /// dictionary index for the closest preceding entry and linearly scans
    /// the main dictionary from its file offset. Both a hit and a miss are
    /// cached.
    pub fn get_term_info(&mut self, term: &Term) -> Result<Option<TermInfo>> {
        let term_key = term.key();
        if let Some(cached) = self.term_info_cache.get(&term_key) {
            return Ok(cached);
        }

        self.load_dictionary_index()?;

        let search_field = self.get_field_num(&term.field);
        if search_field == -1 {
            return Ok(None);
        }
        let search_dic_field = self.field_position(search_field);

        let dictionary = self.dictionary.as_ref().expect("dictionary loaded above");
        let (exact, prev_position) =
            Self::search_dictionary(dictionary, self, search_dic_field, &term.text);

        if let Some(position) = exact {
            let term_info = dictionary.infos[position].clone();
            self.term_info_cache.insert(term_key, Some(term_info.clone()));
            return Ok(Some(term_info));
        }

        let Some(prev_position) = prev_position else {
            // Term is out of the dictionary range.
            return Ok(None);
        };

        let prev_term = dictionary.terms[prev_position].clone();
        let prev_info = dictionary.infos[prev_position].clone();

        let mut tis = self.open_compound_file(".tis")?;
        let marker = tis.read_u32()?;
        if marker != 0xFFFF_FFFE && marker != 0xFFFF_FFFD {
            return Err(KontosError::invalid_file_format(
                "Wrong TermInfoFile file format",
            ));
        }
        let term_count = tis.read_u64()?;
        let index_interval = tis.read_u32()?;
        let skip_interval = tis.read_u32()?;
        if marker == 0xFFFF_FFFD {
            let _max_skip_levels = tis.read_u32()?;
        }

        tis.seek_to(prev_info.index_pointer.expect("index entries carry pointers"))?;

        let mut term_text = prev_term.text;
        let mut term_field_num = prev_term.field_num;
        let mut doc_freq = prev_info.doc_freq;
        let mut freq_pointer = prev_info.freq_pointer;
        let mut prox_pointer = prev_info.prox_pointer;
        let mut skip_offset = prev_info.skip_offset;

        let mut count = prev_position as u64 * index_interval as u64 + 1;
        while count <= term_count
            && (self.field_position(term_field_num) < search_dic_field
                || (self.field_position(term_field_num) == search_dic_field
                    && term_text.as_str() < term.text.as_str()))
        {
            let prefix_length = tis.read_vint()? as usize;
            let suffix = tis.read_string()?;
            term_field_num = tis.read_vint()? as i32;
            let mut text = prefix_by_chars(&term_text, prefix_length).to_string();
            text.push_str(&suffix);
            term_text = text;

            doc_freq = tis.read_vint()?;
            freq_pointer += tis.read_vlong()?;
            prox_pointer += tis.read_vlong()?;
            skip_offset = if doc_freq >= skip_interval {
                tis.read_vint()?
            } else {
                0
            };

            count += 1;
        }

        let term_info = if term_field_num == search_field && term_text == term.text {
            Some(TermInfo::new(doc_freq, freq_pointer, prox_pointer, skip_offset))
        } else {
            None
        };

        self.term_info_cache.insert(term_key, term_info.clone());
        Ok(term_info)
    }

    /// Binary-search the dictionary index.
    ///
    /// Returns the exact match position, or the position of the greatest
    /// sampled entry that precedes the target (`None` when the target sorts
    /// before every entry).
    fn search_dictionary(
        dictionary: &DictionaryIndex,
        reader: &SegmentReader,
        search_dic_field: i32,
        text: &str,
    ) -> (Option<usize>, Option<usize>) {
        let mut low: i64 = 0;
        let mut high: i64 = dictionary.len() as i64 - 1;

        while high >= low {
            let mid = (high + low) >> 1;
            let entry = &dictionary.terms[mid as usize];

            let entry_field = reader.field_position(entry.field_num);
            let ordering = search_dic_field
                .cmp(&entry_field)
                .then_with(|| text.as_bytes().cmp(entry.text.as_bytes()));

            match ordering {
                std::cmp::Ordering::Less => high = mid - 1,
                std::cmp::Ordering::Greater => low = mid + 1,
                std::cmp::Ordering::Equal => return (Some(mid as usize), Some(mid as usize)),
            }
        }

        if high < 0 {
            (None, None)
        } else {
            (None, Some(high as usize))
        }
    }

    // ----- postings --------------------------------------------------------

    /// Decode the `.frq` entry list for a term into (doc id, freq) pairs.
    fn read_freqs(frq: &mut StructReader, doc_freq: u32) -> Result<Vec<(u32, u32)>> {
        let mut freqs = Vec::with_capacity(doc_freq as usize);
        let mut doc_id = 0u32;

        for _ in 0..doc_freq {
            let doc_delta = frq.read_vint()?;
            if doc_delta % 2 == 1 {
                doc_id += (doc_delta - 1) / 2;
                freqs.push((doc_id, 1));
            } else {
                doc_id += doc_delta / 2;
                freqs.push((doc_id, frq.read_vint()?));
            }
        }

        Ok(freqs)
    }

    /// Whether a doc passes the filter entry, narrowing filter bookkeeping.
    fn filter_plan<'a>(
        &self,
        docs_filter: Option<&'a mut DocsFilter>,
    ) -> (Option<&'a mut DocsFilter>, bool) {
        match docs_filter {
            Some(filter) => {
                let has_entry = filter.segment_filters.contains_key(&self.name);
                (Some(filter), has_entry)
            }
            None => (None, false),
        }
    }

    /// Ids of all the documents containing the term, shifted by `shift`.
    pub fn term_docs(
        &mut self,
        term: &Term,
        shift: u32,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<Vec<u32>> {
        let Some(term_info) = self.get_term_info(term)? else {
            if let Some(filter) = docs_filter {
                filter.segment_filters.insert(self.name.clone(), Default::default());
            }
            return Ok(Vec::new());
        };

        let mut frq = self.open_compound_file(".frq")?;
        frq.seek_to(term_info.freq_pointer)?;

        let (filter, has_entry) = self.filter_plan(docs_filter);
        let mut result = Vec::new();

        if let Some(filter) = filter {
            if has_entry {
                let existing = &filter.segment_filters[&self.name];
                if existing.is_empty() {
                    return Ok(Vec::new());
                }

                // The fetch path (selectivity below
                // FULL_SCAN_VS_FETCH_BOUNDARY) and the full scan decode the
                // same entries today; both narrow the filter in place.
                let mut updated = ahash::AHashSet::new();
                for (doc_id, _freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                    if existing.contains(&doc_id) {
                        result.push(shift + doc_id);
                        updated.insert(doc_id);
                    }
                }
                filter.segment_filters.insert(self.name.clone(), updated);
            } else {
                // The filter has no data for this segment yet; seed it.
                let mut filter_data = ahash::AHashSet::new();
                for (doc_id, _freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                    result.push(shift + doc_id);
                    filter_data.insert(doc_id);
                }
                filter.segment_filters.insert(self.name.clone(), filter_data);
            }
        } else {
            for (doc_id, _freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                result.push(shift + doc_id);
            }
        }

        Ok(result)
    }

    /// Term frequencies keyed by (shifted) document id.
    pub fn term_freqs(
        &mut self,
        term: &Term,
        shift: u32,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<BTreeMap<u32, u32>> {
        let Some(term_info) = self.get_term_info(term)? else {
            if let Some(filter) = docs_filter {
                filter.segment_filters.insert(self.name.clone(), Default::default());
            }
            return Ok(BTreeMap::new());
        };

        let mut frq = self.open_compound_file(".frq")?;
        frq.seek_to(term_info.freq_pointer)?;

        let (filter, has_entry) = self.filter_plan(docs_filter);
        let mut result = BTreeMap::new();

        if let Some(filter) = filter {
            if has_entry {
                let existing = &filter.segment_filters[&self.name];
                if existing.is_empty() {
                    return Ok(BTreeMap::new());
                }

                let mut updated = ahash::AHashSet::new();
                for (doc_id, freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                    if existing.contains(&doc_id) {
                        result.insert(shift + doc_id, freq);
                        updated.insert(doc_id);
                    }
                }
                filter.segment_filters.insert(self.name.clone(), updated);
            } else {
                let mut filter_data = ahash::AHashSet::new();
                for (doc_id, freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                    result.insert(shift + doc_id, freq);
                    filter_data.insert(doc_id);
                }
                filter.segment_filters.insert(self.name.clone(), filter_data);
            }
        } else {
            for (doc_id, freq) in Self::read_freqs(&mut frq, term_info.doc_freq)? {
                result.insert(shift + doc_id, freq);
            }
        }

        Ok(result)
    }

    /// Term positions keyed by (shifted) document id.
    ///
    /// The position stream is advanced for every posting, including
    /// documents excluded by the filter, to stay in sync.
    pub fn term_positions(
        &mut self,
        term: &Term,
        shift: u32,
        docs_filter: Option<&mut DocsFilter>,
    ) -> Result<BTreeMap<u32, Vec<u32>>> {
        let Some(term_info) = self.get_term_info(term)? else {
            if let Some(filter) = docs_filter {
                filter.segment_filters.insert(self.name.clone(), Default::default());
            }
            return Ok(BTreeMap::new());
        };

        let mut frq = self.open_compound_file(".frq")?;
        frq.seek_to(term_info.freq_pointer)?;
        let freqs = Self::read_freqs(&mut frq, term_info.doc_freq)?;

        let mut prx = self.open_compound_file(".prx")?;
        prx.seek_to(term_info.prox_pointer)?;

        let (filter, has_entry) = self.filter_plan(docs_filter);
        let mut result = BTreeMap::new();

        if let Some(filter) = filter {
            if has_entry && filter.segment_filters[&self.name].is_empty() {
                return Ok(BTreeMap::new());
            }

            let mut updated = ahash::AHashSet::new();
            for (doc_id, freq) in freqs {
                let positions = Self::read_positions(&mut prx, freq)?;
                let matches = if has_entry {
                    filter.segment_filters[&self.name].contains(&doc_id)
                } else {
                    true
                };
                if matches {
                    updated.insert(doc_id);
                    result.insert(shift + doc_id, positions);
                }
            }
            filter.segment_filters.insert(self.name.clone(), updated);
        } else {
            for (doc_id, freq) in freqs {
                let positions = Self::read_positions(&mut prx, freq)?;
                result.insert(shift + doc_id, positions);
            }
        }

        Ok(result)
    }

    fn read_positions(prx: &mut StructReader, freq: u32) -> Result<Vec<u32>> {
        let mut position = 0u32;
        let mut positions = Vec::with_capacity(freq as usize);
        for _ in 0..freq {
            position += prx.read_vint()?;
            positions.push(position);
        }
        Ok(positions)
    }

    // ----- norms -----------------------------------------------------------

    /// Normalization factor for a document and field.
    pub fn norm(&mut self, id: u32, field_name: &str) -> Result<Option<f32>> {
        let field_num = self.get_field_num(field_name);
        if field_num < 0 || !self.fields[field_num as usize].is_indexed {
            return Ok(None);
        }

        let field_num = field_num as u32;
        if !self.norms.contains_key(&field_num) {
            self.load_norm(field_num)?;
        }

        Ok(self
            .norms
            .get(&field_num)
            .and_then(|vector| vector.get(id as usize))
            .map(|byte| similarity::decode_norm(*byte)))
    }

    /// The norm vector of a field, one byte per document.
    ///
    /// Fields missing from this segment (or not indexed) yield a synthetic
    /// vector of default norms, so merging stays total.
    pub fn norm_vector(&mut self, field_name: &str) -> Result<Vec<u8>> {
        let field_num = self.get_field_num(field_name);
        if field_num < 0 || !self.fields[field_num as usize].is_indexed {
            let default = similarity::encode_norm(similarity::length_norm(0));
            return Ok(vec![default; self.doc_count as usize]);
        }

        let field_num = field_num as u32;
        if !self.norms.contains_key(&field_num) {
            self.load_norm(field_num)?;
        }

        Ok(self.norms[&field_num].clone())
    }

    fn load_norm(&mut self, field_num: u32) -> Result<()> {
        if self.has_single_norm_file {
            let mut nrm = self.open_compound_file(".nrm")?;

            let header = nrm.read_bytes(3)?;
            let header_format = nrm.read_byte()?;
            if header != b"NRM" || header_format != 0xFF {
                return Err(KontosError::invalid_file_format("Wrong norms file format"));
            }

            // One contiguous run per indexed field, in field-number order.
            // Norms-omitted fields carry no run; they were prefilled at
            // open time.
            for number in 0..self.fields.len() as u32 {
                let field = &self.fields[number as usize];
                if field.is_indexed && !field.norms_omitted {
                    let run = nrm.read_bytes(self.doc_count as usize)?;
                    self.norms.insert(number, run);
                }
            }
        } else {
            let mut legacy = self.open_compound_file(&format!(".f{field_num}"))?;
            let run = legacy.read_bytes(self.doc_count as usize)?;
            self.norms.insert(field_num, run);
        }

        Ok(())
    }

    // ----- stored documents ------------------------------------------------

    /// Read the stored fields of a document by local id.
    ///
    /// Deleted documents remain readable until their segment is merged
    /// away.
    pub fn document(&mut self, id: u32) -> Result<Document> {
        if id >= self.doc_count {
            return Err(KontosError::invalid_argument(format!(
                "Document id {id} is out of range for segment '{}'",
                self.name
            )));
        }

        let mut fdx = self.open_compound_file(".fdx")?;
        fdx.seek_to(id as u64 * 8)?;
        let record_offset = fdx.read_u64()?;

        let mut fdt = self.open_compound_file(".fdt")?;
        fdt.seek_to(record_offset)?;

        let fields = self.read_stored_record(&mut fdt)?;
        let mut document = Document::new();
        for field in fields {
            document.add_field(field);
        }
        Ok(document)
    }

    /// Decode one stored-field record at the current `.fdt` position.
    pub(crate) fn read_stored_record(&self, fdt: &mut StructReader) -> Result<Vec<Field>> {
        let field_count = fdt.read_vint()?;
        let mut fields = Vec::with_capacity(field_count as usize);

        for _ in 0..field_count {
            let field_num = fdt.read_vint()?;
            let bits = fdt.read_byte()?;
            let field_info = self.field(field_num).ok_or_else(|| {
                KontosError::invalid_file_format(format!(
                    "Stored record references unknown field {field_num}"
                ))
            })?;

            let is_tokenized = bits & 0x01 != 0;
            let is_binary = bits & 0x02 != 0;
            let value = if is_binary {
                FieldValue::Binary(fdt.read_binary()?)
            } else {
                FieldValue::Text(fdt.read_string()?)
            };

            fields.push(Field {
                name: field_info.name.clone(),
                value,
                is_stored: true,
                is_indexed: field_info.is_indexed,
                is_tokenized,
                store_term_vector: field_info.store_term_vector,
                boost: 1.0,
            });
        }

        Ok(fields)
    }

    // ----- terms stream ----------------------------------------------------

    /// Reset the terms stream.
    ///
    /// `start_id` is the id assigned to this segment's first document;
    /// merge mode compacts ids over deleted documents. Returns the start
    /// document id for the next segment.
    pub fn reset_terms_stream_with(&mut self, start_id: u32, mode: ScanMode) -> Result<u32> {
        self.close_terms_stream();

        let mut tis = self.open_compound_file(".tis")?;
        let marker = tis.read_u32()?;
        if marker != 0xFFFF_FFFE && marker != 0xFFFF_FFFD {
            return Err(KontosError::invalid_file_format(
                "Wrong TermInfoFile file format",
            ));
        }

        let term_num = tis.read_u64()?;
        self.stream_index_interval = tis.read_u32()?;
        self.stream_skip_interval = tis.read_u32()?;
        if marker == 0xFFFF_FFFD {
            let _max_skip_levels = tis.read_u32()?;
        }

        self.stream_term_num = term_num;
        self.stream_term_count = term_num;
        self.tis_stream = Some(tis);
        self.stream_last_field_num = -1;
        self.stream_last_text.clear();
        self.stream_last_info = TermInfo::new(0, 0, 0, 0);
        self.stream_mode = mode;

        let mut live_count = 0u32;
        match mode {
            ScanMode::TermsOnly => {}
            ScanMode::FullInfo | ScanMode::MergeInfo => {
                self.frq_stream = Some(self.open_compound_file(".frq")?);
                self.prx_stream = Some(self.open_compound_file(".prx")?);

                let mut doc_map = vec![None; self.doc_count as usize];
                for doc in 0..self.doc_count {
                    if !self.is_deleted(doc) {
                        let mapped = if mode == ScanMode::MergeInfo {
                            start_id + live_count
                        } else {
                            start_id + doc
                        };
                        doc_map[doc as usize] = Some(mapped);
                        live_count += 1;
                    }
                }
                self.doc_map = Some(doc_map);
            }
        }

        let next_segment_start_id = start_id
            + if mode == ScanMode::MergeInfo {
                live_count
            } else {
                self.doc_count
            };

        self.advance_term()?;

        Ok(next_segment_start_id)
    }

    /// Advance the stream and return the next term.
    pub fn advance_term(&mut self) -> Result<Option<Term>> {
        if self.tis_stream.is_none() || self.stream_term_count == 0 {
            self.current = None;
            self.current_positions = None;
            self.doc_map = None;

            // May be necessary for an "empty" segment.
            self.tis_stream = None;
            self.frq_stream = None;
            self.prx_stream = None;

            return Ok(None);
        }

        let tis = self.tis_stream.as_mut().expect("stream open checked above");
        let prefix_length = tis.read_vint()? as usize;
        let suffix = tis.read_string()?;
        let field_num = tis.read_vint()? as i32;
        let mut text = prefix_by_chars(&self.stream_last_text, prefix_length).to_string();
        text.push_str(&suffix);

        let doc_freq = tis.read_vint()?;
        let freq_pointer = self.stream_last_info.freq_pointer + tis.read_vlong()?;
        let prox_pointer = self.stream_last_info.prox_pointer + tis.read_vlong()?;
        let skip_offset = if doc_freq >= self.stream_skip_interval {
            tis.read_vint()?
        } else {
            0
        };

        self.stream_last_text = text.clone();
        self.stream_last_field_num = field_num;
        self.stream_last_info = TermInfo::new(doc_freq, freq_pointer, prox_pointer, skip_offset);

        let field_name = self
            .fields
            .get(field_num as usize)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        self.current = Some(Term::new(field_name, text));

        if matches!(self.stream_mode, ScanMode::FullInfo | ScanMode::MergeInfo) {
            self.load_stream_positions()?;
        }

        self.stream_term_count -= 1;
        if self.stream_term_count == 0 {
            self.tis_stream = None;
            self.frq_stream = None;
            self.prx_stream = None;
        }

        Ok(self.current.clone())
    }

    fn load_stream_positions(&mut self) -> Result<()> {
        let info = self.stream_last_info.clone();

        let frq = self
            .frq_stream
            .as_mut()
            .ok_or_else(|| KontosError::index("Terms stream postings files are not open"))?;
        frq.seek_to(info.freq_pointer)?;
        let freqs = Self::read_freqs(frq, info.doc_freq)?;

        let prx = self
            .prx_stream
            .as_mut()
            .ok_or_else(|| KontosError::index("Terms stream postings files are not open"))?;
        prx.seek_to(info.prox_pointer)?;

        let doc_map = self.doc_map.as_ref();
        let mut mapped_positions = BTreeMap::new();
        for (doc_id, freq) in freqs {
            let positions = Self::read_positions(prx, freq)?;
            if let Some(mapped) = doc_map.and_then(|map| map[doc_id as usize]) {
                mapped_positions.insert(mapped, positions);
            }
        }

        self.current_positions = Some(mapped_positions);
        Ok(())
    }

    /// Skip the terms stream up to the specified term prefix.
    pub fn skip_terms_to(&mut self, prefix: &Term) -> Result<()> {
        self.load_dictionary_index()?;
        if self.stream_index_interval == 0 {
            // The stream was never reset; start it in terms-only mode.
            self.reset_terms_stream_with(0, ScanMode::TermsOnly)?;
        }

        let search_field = self.get_field_num(&prefix.field);
        if search_field == -1 {
            // Field is not present in this segment: go to the end of the
            // dictionary.
            self.tis_stream = None;
            self.frq_stream = None;
            self.prx_stream = None;
            self.current = None;
            self.current_positions = None;
            return Ok(());
        }
        let search_dic_field = self.field_position(search_field);

        let dictionary = self.dictionary.as_ref().expect("dictionary loaded above");
        let (exact, prev_position) =
            Self::search_dictionary(dictionary, self, search_dic_field, &prefix.text);
        let prev_position = exact.or(prev_position);

        let Some(prev_position) = prev_position else {
            // Term is out of the dictionary range.
            self.tis_stream = None;
            self.frq_stream = None;
            self.prx_stream = None;
            self.current = None;
            self.current_positions = None;
            return Ok(());
        };

        let prev_term = dictionary.terms[prev_position].clone();
        let prev_info = dictionary.infos[prev_position].clone();

        if self.tis_stream.is_none() {
            // The end of the stream was reached and the dictionary file is
            // closed; perform a mini-reset.
            self.tis_stream = Some(self.open_compound_file(".tis")?);
            if matches!(self.stream_mode, ScanMode::FullInfo | ScanMode::MergeInfo) {
                self.frq_stream = Some(self.open_compound_file(".frq")?);
                self.prx_stream = Some(self.open_compound_file(".prx")?);
            }
        }
        self.tis_stream
            .as_mut()
            .expect("stream opened above")
            .seek_to(prev_info.index_pointer.expect("index entries carry pointers"))?;

        self.stream_last_field_num = prev_term.field_num;
        self.stream_last_text = prev_term.text.clone();
        self.stream_last_info = TermInfo::new(
            prev_info.doc_freq,
            prev_info.freq_pointer,
            prev_info.prox_pointer,
            prev_info.skip_offset,
        );
        let field_name = if prev_term.field_num < 0 {
            String::new()
        } else {
            self.fields
                .get(prev_term.field_num as usize)
                .map(|f| f.name.clone())
                .unwrap_or_default()
        };
        self.current = Some(Term::new(field_name, prev_term.text));
        self.stream_term_count =
            self.stream_term_num - prev_position as u64 * self.stream_index_interval as u64;

        if prev_position == 0 {
            // Skip the leading synthetic entry.
            self.advance_term()?;
        } else if self
            .current
            .as_ref()
            .is_some_and(|cur| cur.field == prefix.field && cur.text == prefix.text)
        {
            // Exact match in the dictionary index.
            if matches!(self.stream_mode, ScanMode::FullInfo | ScanMode::MergeInfo) {
                self.load_stream_positions()?;
            }
            return Ok(());
        }

        // Advance until the current term matches or exceeds the prefix.
        while let Some(current) = &self.current {
            if current.field.as_str() > prefix.field.as_str()
                || (current.field == prefix.field && current.text >= prefix.text)
            {
                return Ok(());
            }
            self.advance_term()?;
        }

        Ok(())
    }

    /// The term at the current stream position.
    pub fn current_term(&self) -> Option<&Term> {
        self.current.as_ref()
    }

    /// The dictionary record of the current stream term.
    pub fn current_term_info(&self) -> Option<&TermInfo> {
        self.current.as_ref().map(|_| &self.stream_last_info)
    }

    /// Positions of the current term, keyed by (mapped) document id.
    ///
    /// Only populated in full-info and merge-info scan modes.
    pub fn current_term_positions(&self) -> Option<&BTreeMap<u32, Vec<u32>>> {
        self.current_positions.as_ref()
    }

    /// Release terms stream resources.
    pub fn close_stream(&mut self) {
        self.tis_stream = None;
        self.frq_stream = None;
        self.prx_stream = None;
        self.current = None;
        self.current_positions = None;
        self.doc_map = None;
    }
}

impl TermsStream for SegmentReader {
    fn reset_terms_stream(&mut self) -> Result<()> {
        self.reset_terms_stream_with(0, ScanMode::TermsOnly)?;
        Ok(())
    }

    fn skip_to(&mut self, prefix: &Term) -> Result<()> {
        self.skip_terms_to(prefix)
    }

    fn next_term(&mut self) -> Result<Option<Term>> {
        self.advance_term()
    }

    fn current_term(&self) -> Option<&Term> {
        SegmentReader::current_term(self)
    }

    fn close_terms_stream(&mut self) {
        self.close_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_info_cache_eviction() {
        let mut cache = TermInfoCache::default();

        for i in 0..TERM_INFO_CACHE_SIZE {
            cache.insert(
                format!("key{i}").into_bytes(),
                Some(TermInfo::new(i as u32, 0, 0, 0)),
            );
        }

        // Insert 1024 triggers the batch eviction down to 768.
        assert_eq!(cache.len(), TERM_INFO_CACHE_EVICT_TO);

        // The freshest entries survive.
        let last = format!("key{}", TERM_INFO_CACHE_SIZE - 1).into_bytes();
        assert!(cache.get(&last).is_some());

        // The oldest were evicted.
        assert!(cache.get(b"key0".as_slice()).is_none());
    }

    #[test]
    fn test_term_info_cache_hit_refreshes_recency() {
        let mut cache = TermInfoCache::default();

        cache.insert(b"old".to_vec(), None);
        for i in 0..(TERM_INFO_CACHE_SIZE - 2) {
            cache.insert(format!("key{i}").into_bytes(), None);
        }

        // Touch the oldest entry, then overflow the cache.
        assert!(cache.get(b"old".as_slice()).is_some());
        cache.insert(b"overflow".to_vec(), None);

        assert!(cache.get(b"old".as_slice()).is_some());
    }

    #[test]
    fn test_cache_stores_negative_lookups() {
        let mut cache = TermInfoCache::default();
        cache.insert(b"missing".to_vec(), None);

        // A cached miss is distinguishable from an uncached key.
        assert_eq!(cache.get(b"missing".as_slice()), Some(None));
        assert_eq!(cache.get(b"unknown".as_slice()), None);
    }
}
