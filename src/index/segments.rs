//! Segments file codec and generation management.
//!
//! The authoritative list of segments lives in a `segments_<N>` file, where
//! `N` is a monotonically increasing generation in base-36. `segments.gen`
//! mirrors the current generation, written twice so a torn write can be
//! detected. Generation 0 predates the generation scheme and uses a plain
//! `segments` file.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::error::{KontosError, Result};
use crate::storage::{Storage, StructReader, StructWriter};
use crate::util::base36;

/// Marker of the `segments.gen` file.
pub const SEGMENTS_GEN_MARKER: u32 = 0xFFFF_FFFE;

/// Sentinel meaning "no value" in 4-byte fields.
pub const NO_VALUE: u32 = 0xFFFF_FFFF;

/// File name extensions owned by the index.
pub const INDEX_EXTENSIONS: &[&str] = &[
    ".cfs", ".cfx", ".fnm", ".fdx", ".fdt", ".tis", ".tii", ".frq", ".prx", ".tvx", ".tvd",
    ".tvf", ".del", ".sti",
];

/// Supported index format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Pre-2.1 format: plain `segments` file, per-segment `.del` files.
    Pre21,
    /// 2.1 format: generation files, incremental delete generations.
    V21,
    /// 2.3 format: 2.1 plus shared doc store descriptors.
    V23,
}

impl FormatVersion {
    /// The marker integer written at the start of a segments file.
    pub fn marker(&self) -> u32 {
        match self {
            FormatVersion::Pre21 => 0xFFFF_FFFF,
            FormatVersion::V21 => 0xFFFF_FFFD,
            FormatVersion::V23 => 0xFFFF_FFFC,
        }
    }

    /// Decode a segments file marker.
    pub fn from_marker(marker: u32) -> Result<Self> {
        match marker {
            0xFFFF_FFFF => Ok(FormatVersion::Pre21),
            0xFFFF_FFFD => Ok(FormatVersion::V21),
            0xFFFF_FFFC => Ok(FormatVersion::V23),
            _ => Err(KontosError::invalid_file_format(
                "Unsupported segments file format",
            )),
        }
    }
}

/// Shared doc store descriptor carried by 2.3 segment entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocStoreOptions {
    /// The starting document in the shared doc store files where this
    /// segment's documents begin.
    pub offset: u32,

    /// The name of the segment that has the shared doc store files.
    pub segment: String,

    /// True if compound file format is used for the shared doc store.
    pub is_compound: bool,
}

/// One per-segment record of a segments file.
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Segment name.
    pub name: String,

    /// Number of documents in the segment, including deleted ones.
    pub doc_count: u32,

    /// Delete file generation: -1 none, 0 pre-2.1 file, N>0 generation N.
    pub del_gen: i64,

    /// Shared doc store descriptor, if any.
    pub doc_store: Option<DocStoreOptions>,

    /// Whether the segment uses one `.nrm` file for all fields.
    pub has_single_norm_file: bool,

    /// Per-field norm generations, or empty with the no-value sentinel.
    pub norm_gens: Vec<i64>,

    /// Raw compound-file byte: 0xFF no, 0x00 unknown, 0x01 yes.
    pub is_compound_byte: u8,
}

impl SegmentEntry {
    /// Compound-file status: `Some(true)`, `Some(false)`, or `None` when it
    /// must be detected from the directory.
    pub fn is_compound(&self) -> Option<bool> {
        match self.is_compound_byte {
            0x01 => Some(true),
            0xFF => Some(false),
            _ => None,
        }
    }

    /// Read one entry in the given source format.
    pub fn read(reader: &mut StructReader, format: FormatVersion) -> Result<Self> {
        let name = reader.read_string()?;
        let doc_count = reader.read_u32()?;

        if format == FormatVersion::Pre21 {
            return Ok(SegmentEntry {
                name,
                doc_count,
                del_gen: 0,
                doc_store: None,
                has_single_norm_file: false,
                norm_gens: Vec::new(),
                is_compound_byte: 0x00,
            });
        }

        let del_gen = reader.read_i64()?;

        let doc_store = if format == FormatVersion::V23 {
            let doc_store_offset = reader.read_u32()?;
            if doc_store_offset != NO_VALUE {
                let segment = reader.read_string()?;
                let is_compound = reader.read_byte()? == 1;
                Some(DocStoreOptions {
                    offset: doc_store_offset,
                    segment,
                    is_compound,
                })
            } else {
                None
            }
        } else {
            None
        };

        let has_single_norm_file = reader.read_byte()? != 0;
        let num_field = reader.read_u32()?;
        let mut norm_gens = Vec::new();
        if num_field != NO_VALUE {
            for _ in 0..num_field {
                norm_gens.push(reader.read_i64()?);
            }
        }
        let is_compound_byte = reader.read_byte()?;

        Ok(SegmentEntry {
            name,
            doc_count,
            del_gen,
            doc_store,
            has_single_norm_file,
            norm_gens,
            is_compound_byte,
        })
    }

    /// Write this entry in the given target format.
    pub fn write(&self, writer: &mut StructWriter, format: FormatVersion) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_u32(self.doc_count)?;
        writer.write_i64(self.del_gen)?;

        match format {
            FormatVersion::V23 => {
                if let Some(doc_store) = &self.doc_store {
                    writer.write_u32(doc_store.offset)?;
                    writer.write_string(&doc_store.segment)?;
                    writer.write_byte(if doc_store.is_compound { 1 } else { 0 })?;
                } else {
                    writer.write_u32(NO_VALUE)?;
                }
            }
            FormatVersion::V21 => {
                if self.doc_store.is_some() {
                    return Err(KontosError::index(
                        "Index conversion to lower format version is not supported",
                    ));
                }
            }
            FormatVersion::Pre21 => {
                return Err(KontosError::invalid_argument(
                    "Writing pre-2.1 segments files is not supported",
                ));
            }
        }

        writer.write_byte(if self.has_single_norm_file { 1 } else { 0 })?;
        if self.norm_gens.is_empty() {
            writer.write_u32(NO_VALUE)?;
        } else {
            writer.write_u32(self.norm_gens.len() as u32)?;
            for norm_gen in &self.norm_gens {
                writer.write_i64(*norm_gen)?;
            }
        }
        writer.write_byte(self.is_compound_byte)?;

        Ok(())
    }
}

/// A parsed segments file.
#[derive(Debug, Clone)]
pub struct SegmentsFile {
    /// Source format.
    pub format: FormatVersion,

    /// Index version counter.
    pub version: u64,

    /// Segment name counter.
    pub name_counter: u32,

    /// Per-segment entries in file order.
    pub segments: Vec<SegmentEntry>,
}

/// Return the segments file name for a generation.
pub fn segment_file_name(generation: i64) -> String {
    if generation <= 0 {
        return "segments".to_string();
    }

    format!("segments_{}", base36::encode(generation as u64))
}

/// Determine the current index generation.
///
/// Reads `segments.gen` and verifies the doubled generation number. A torn
/// pointer is retried a bounded number of times, then the directory is
/// scanned for the highest `segments_<N>` file. Returns -1 when the
/// directory holds no index at all.
pub fn actual_generation(storage: &dyn Storage) -> Result<i64> {
    if storage.file_exists("segments.gen") {
        for attempt in 0..10 {
            let mut reader = StructReader::new(storage.open_input("segments.gen")?)?;
            let marker = reader.read_u32()?;
            if marker != SEGMENTS_GEN_MARKER {
                return Err(KontosError::invalid_file_format(
                    "Wrong segments.gen file format",
                ));
            }

            let gen1 = reader.read_i64()?;
            let gen2 = reader.read_i64()?;
            if gen1 == gen2 {
                return Ok(gen1);
            }

            // Torn generation pointer; give the writer a moment to finish.
            if attempt < 9 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    // Fall back to a directory scan.
    let pattern = Regex::new(r"^segments_([0-9a-zA-Z]+)$").expect("static regex");
    let mut max_generation: i64 = -1;
    for file in storage.list_files()? {
        if let Some(captures) = pattern.captures(&file) {
            let generation = base36::decode(&captures[1])? as i64;
            max_generation = max_generation.max(generation);
        }
    }

    if max_generation >= 0 {
        return Ok(max_generation);
    }
    if storage.file_exists("segments") {
        return Ok(0);
    }

    Ok(-1)
}

/// Read and parse the segments file of the current generation.
pub fn read_segments_file(storage: &dyn Storage) -> Result<SegmentsFile> {
    let generation = actual_generation(storage)?;
    if generation < 0 {
        return Err(KontosError::index("Index doesn't exist in the directory"));
    }

    read_segments_file_at(storage, generation)
}

/// Read and parse the segments file of a specific generation.
pub fn read_segments_file_at(storage: &dyn Storage, generation: i64) -> Result<SegmentsFile> {
    let mut reader = StructReader::new(storage.open_input(&segment_file_name(generation))?)?;

    let format = FormatVersion::from_marker(reader.read_u32()?)?;
    let version = reader.read_u64()?;
    let name_counter = reader.read_u32()?;
    let segment_count = reader.read_u32()?;

    let mut segments = Vec::with_capacity(segment_count as usize);
    for _ in 0..segment_count {
        segments.push(SegmentEntry::read(&mut reader, format)?);
    }

    Ok(SegmentsFile {
        format,
        version,
        name_counter,
        segments,
    })
}

/// Create an empty index.
///
/// Generation 0 writes a pre-2.1 `segments` file plus the legacy
/// `deletable` file, clearing stale index files first. Generations ≥ 1
/// write `segments.gen` and an empty `segments_<N>` file in 2.1 format.
pub fn create_index(storage: &dyn Storage, generation: i64, name_counter: u32) -> Result<()> {
    let version = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if generation == 0 {
        // Create index in pre-2.1 mode.
        let norm_pattern = Regex::new(r"\.f\d+$").expect("static regex");
        for file in storage.list_files()? {
            let is_index_file = file == "deletable"
                || file == "segments"
                || (file.len() >= 4 && INDEX_EXTENSIONS.contains(&&file[file.len() - 4..]))
                || norm_pattern.is_match(&file);
            if is_index_file {
                storage.delete_file(&file)?;
            }
        }

        let mut segments_file = StructWriter::new(storage.create_output("segments")?);
        segments_file.write_u32(FormatVersion::Pre21.marker())?;
        segments_file.write_u64(version)?;
        segments_file.write_u32(name_counter)?;
        segments_file.write_u32(0)?; // segment counter
        segments_file.close()?;

        let mut deletable_file = StructWriter::new(storage.create_output("deletable")?);
        deletable_file.write_u32(0)?;
        deletable_file.close()?;
    } else {
        let mut gen_file = StructWriter::new(storage.create_output("segments.gen")?);
        gen_file.write_u32(SEGMENTS_GEN_MARKER)?;
        // Write generation two times
        gen_file.write_i64(generation)?;
        gen_file.write_i64(generation)?;
        gen_file.close()?;

        let mut segments_file =
            StructWriter::new(storage.create_output(&segment_file_name(generation))?);
        segments_file.write_u32(FormatVersion::V21.marker())?;
        segments_file.write_u64(version)?;
        segments_file.write_u32(name_counter)?;
        segments_file.write_u32(0)?; // segment counter
        segments_file.close()?;
    }

    Ok(())
}
