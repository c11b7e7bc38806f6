//! Segment writers: build a new segment's files.
//!
//! [`SegmentWriterBase`] holds the codec shared by both concrete writers:
//! stored field records, the prefix-compressed term dictionary with its
//! sampled index, postings, field metadata with norms, and compound-file
//! packing. [`DocumentWriter`] buffers documents in memory and flushes them
//! sorted; [`StreamWriter`] accepts already-sorted postings from the
//! merger and streams them straight to disk.

pub mod document_writer;
pub mod stream_writer;

pub use document_writer::DocumentWriter;
pub use stream_writer::StreamWriter;

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::document::Field;
use crate::error::{KontosError, Result};
use crate::index::config::IndexConfig;
use crate::index::field_info::FieldInfo;
use crate::index::term::{Term, TermInfo, common_prefix};
use crate::search::similarity;
use crate::storage::{Storage, StructWriter};

/// Size of the copy buffer used while packing the compound file.
const CFS_COPY_CHUNK: usize = 131072;

/// State and codec shared by the segment writers.
#[derive(Debug)]
pub struct SegmentWriterBase {
    storage: Arc<dyn Storage>,
    name: String,
    doc_count: u32,

    index_interval: u32,
    skip_interval: u32,
    max_skip_levels: u32,

    /// Files written so far, for compound file generation.
    files: Vec<String>,

    /// Field infos in registration order.
    pub(crate) fields: Vec<FieldInfo>,
    field_numbers: AHashMap<String, u32>,

    /// Norm vectors keyed by field name.
    pub(crate) norms: AHashMap<String, Vec<u8>>,

    fdx: Option<StructWriter>,
    fdt: Option<StructWriter>,
    tis: Option<StructWriter>,
    tii: Option<StructWriter>,
    frq: Option<StructWriter>,
    prx: Option<StructWriter>,

    term_count: u64,
    prev_term: Option<(u32, String)>,
    prev_term_info: Option<TermInfo>,
    prev_index_term: Option<(u32, String)>,
    prev_index_term_info: Option<TermInfo>,
    last_index_position: u64,
}

impl SegmentWriterBase {
    /// Create a new segment writer base.
    pub fn new(storage: Arc<dyn Storage>, name: &str, config: &IndexConfig) -> Self {
        SegmentWriterBase {
            storage,
            name: name.to_string(),
            doc_count: 0,
            index_interval: config.index_interval,
            skip_interval: config.skip_interval,
            max_skip_levels: config.max_skip_levels,
            files: Vec::new(),
            fields: Vec::new(),
            field_numbers: AHashMap::new(),
            norms: AHashMap::new(),
            fdx: None,
            fdt: None,
            tis: None,
            tii: None,
            frq: None,
            prx: None,
            term_count: 0,
            prev_term: None,
            prev_term_info: None,
            prev_index_term: None,
            prev_index_term_info: None,
            last_index_position: 0,
        }
    }

    /// The storage this writer targets.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of documents written into this segment.
    pub fn count(&self) -> u32 {
        self.doc_count
    }

    /// Register a field, returning its actual number.
    ///
    /// Re-registering a field ORs its indexing flags into the existing
    /// record.
    pub fn add_field(&mut self, field: &Field) -> u32 {
        if let Some(&number) = self.field_numbers.get(&field.name) {
            let info = &mut self.fields[number as usize];
            info.is_indexed |= field.is_indexed;
            info.store_term_vector |= field.store_term_vector;
            return number;
        }

        let number = self.fields.len() as u32;
        self.fields.push(FieldInfo::new(
            field.name.clone(),
            number,
            field.is_indexed,
            field.store_term_vector,
        ));
        self.field_numbers.insert(field.name.clone(), number);
        number
    }

    /// Register a field from another segment's metadata, returning its
    /// actual number in this segment.
    pub fn add_field_info(&mut self, field_info: &FieldInfo) -> u32 {
        if let Some(&number) = self.field_numbers.get(&field_info.name) {
            let info = &mut self.fields[number as usize];
            info.is_indexed |= field_info.is_indexed;
            info.store_term_vector |= field_info.store_term_vector;
            return number;
        }

        let number = self.fields.len() as u32;
        self.fields.push(FieldInfo::new(
            field_info.name.clone(),
            number,
            field_info.is_indexed,
            field_info.store_term_vector,
        ));
        self.field_numbers.insert(field_info.name.clone(), number);
        number
    }

    /// Field infos in registration order.
    pub fn field_infos(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Create the stored fields files.
    pub fn create_stored_fields_files(&mut self) -> Result<()> {
        if self.fdx.is_none() {
            self.fdx = Some(StructWriter::new(
                self.storage.create_output(&format!("{}.fdx", self.name))?,
            ));
            self.fdt = Some(StructWriter::new(
                self.storage.create_output(&format!("{}.fdt", self.name))?,
            ));

            self.files.push(format!("{}.fdx", self.name));
            self.files.push(format!("{}.fdt", self.name));
        }
        Ok(())
    }

    /// Append one document's stored fields and advance the doc count.
    ///
    /// Every field must have been registered through
    /// [`SegmentWriterBase::add_field`] or
    /// [`SegmentWriterBase::add_field_info`] beforehand.
    pub fn add_stored_fields(&mut self, stored_fields: &[Field]) -> Result<()> {
        self.create_stored_fields_files()?;

        let fdt_position = self.fdt.as_ref().expect("created above").tell();
        let fdx = self.fdx.as_mut().expect("created above");
        fdx.write_u64(fdt_position)?;

        let fdt = self.fdt.as_mut().expect("created above");
        fdt.write_vint(stored_fields.len() as u32)?;
        for field in stored_fields {
            let number = *self.field_numbers.get(&field.name).ok_or_else(|| {
                KontosError::index(format!("Stored field '{}' was not registered", field.name))
            })?;
            fdt.write_vint(number)?;

            let field_bits = (field.is_tokenized as u8) | ((field.is_binary() as u8) << 1);
            fdt.write_byte(field_bits)?;
            match &field.value {
                crate::document::FieldValue::Binary(bytes) => fdt.write_binary(bytes)?,
                crate::document::FieldValue::Text(text) => fdt.write_string(text)?,
            }
        }

        self.doc_count += 1;
        Ok(())
    }

    /// Append a norm vector for a field.
    pub fn add_norm(&mut self, field_name: &str, norm_vector: &[u8]) {
        self.norms
            .entry(field_name.to_string())
            .or_default()
            .extend_from_slice(norm_vector);
    }

    /// Create the dictionary, frequency and position files and write their
    /// headers.
    pub fn initialize_dictionary_files(&mut self) -> Result<()> {
        let mut tis = StructWriter::new(
            self.storage.create_output(&format!("{}.tis", self.name))?,
        );
        tis.write_u32(0xFFFF_FFFD)?;
        tis.write_u64(0)?; // dummy data for terms count
        tis.write_u32(self.index_interval)?;
        tis.write_u32(self.skip_interval)?;
        tis.write_u32(self.max_skip_levels)?;

        let mut tii = StructWriter::new(
            self.storage.create_output(&format!("{}.tii", self.name))?,
        );
        tii.write_u32(0xFFFF_FFFD)?;
        tii.write_u64(0)?; // dummy data for terms count
        tii.write_u32(self.index_interval)?;
        tii.write_u32(self.skip_interval)?;
        tii.write_u32(self.max_skip_levels)?;

        // Leading synthetic index entry: the empty term before the start
        // of the dictionary.
        tii.write_vint(0)?; // prefix length
        tii.write_string("")?; // suffix
        tii.write_vint(0xFFFF_FFFF)?; // field number -1
        tii.write_vint(0)?; // doc freq
        tii.write_vint(0)?; // freq delta
        tii.write_vint(0)?; // prox delta
        tii.write_vint(24)?; // index delta

        self.tis = Some(tis);
        self.tii = Some(tii);
        self.frq = Some(StructWriter::new(
            self.storage.create_output(&format!("{}.frq", self.name))?,
        ));
        self.prx = Some(StructWriter::new(
            self.storage.create_output(&format!("{}.prx", self.name))?,
        ));

        self.files.push(format!("{}.tis", self.name));
        self.files.push(format!("{}.tii", self.name));
        self.files.push(format!("{}.frq", self.name));
        self.files.push(format!("{}.prx", self.name));

        self.prev_term = None;
        self.prev_term_info = None;
        self.prev_index_term = None;
        self.prev_index_term_info = None;
        self.last_index_position = 24;
        self.term_count = 0;

        Ok(())
    }

    /// Write one term and its postings.
    ///
    /// `term_docs` maps document id to that document's term positions and
    /// must be ordered by document id. Terms must arrive in dictionary
    /// order.
    pub fn add_term(&mut self, term: &Term, term_docs: &BTreeMap<u32, Vec<u32>>) -> Result<()> {
        let frq = self.frq.as_mut().expect("dictionary files initialized");
        let prx = self.prx.as_mut().expect("dictionary files initialized");

        let freq_pointer = frq.tell();
        let prox_pointer = prx.tell();

        let mut prev_doc = 0u32;
        for (doc_id, positions) in term_docs {
            let doc_delta = (doc_id - prev_doc) * 2;
            prev_doc = *doc_id;
            if positions.len() > 1 {
                frq.write_vint(doc_delta)?;
                frq.write_vint(positions.len() as u32)?;
            } else {
                frq.write_vint(doc_delta + 1)?;
            }

            let mut prev_position = 0u32;
            for position in positions {
                prx.write_vint(position - prev_position)?;
                prev_position = *position;
            }
        }

        let skip_offset = if term_docs.len() as u32 >= self.skip_interval {
            (frq.tell() - freq_pointer) as u32
        } else {
            0
        };

        let field_num = *self.field_numbers.get(&term.field).ok_or_else(|| {
            KontosError::index(format!("Term field '{}' was not registered", term.field))
        })?;
        let term_info = TermInfo::new(term_docs.len() as u32, freq_pointer, prox_pointer, skip_offset);

        let tis = self.tis.as_mut().expect("dictionary files initialized");
        dump_term_dict_entry(
            tis,
            &mut self.prev_term,
            &mut self.prev_term_info,
            field_num,
            &term.text,
            &term_info,
        )?;

        if (self.term_count + 1) % self.index_interval as u64 == 0 {
            let tii = self.tii.as_mut().expect("dictionary files initialized");
            dump_term_dict_entry(
                tii,
                &mut self.prev_index_term,
                &mut self.prev_index_term_info,
                field_num,
                &term.text,
                &term_info,
            )?;

            let index_position = self.tis.as_ref().expect("initialized").tell();
            let tii = self.tii.as_mut().expect("initialized");
            tii.write_vlong(index_position - self.last_index_position)?;
            self.last_index_position = index_position;
        }
        self.term_count += 1;

        Ok(())
    }

    /// Patch the term counts into the dictionary headers and close the
    /// dictionary files.
    pub fn close_dictionary_files(&mut self) -> Result<()> {
        if let Some(mut tis) = self.tis.take() {
            tis.seek_to(4)?;
            tis.write_u64(self.term_count)?;
            tis.close()?;
        }

        if let Some(mut tii) = self.tii.take() {
            tii.seek_to(4)?;
            // +1 counts the leading synthetic entry.
            tii.write_u64(
                (self.term_count - self.term_count % self.index_interval as u64)
                    / self.index_interval as u64
                    + 1,
            )?;
            tii.close()?;
        }

        Ok(())
    }

    /// Write the field metadata (`.fnm`) and norms (`.nrm`) files.
    pub fn dump_fnm(&mut self) -> Result<()> {
        let mut fnm = StructWriter::new(
            self.storage.create_output(&format!("{}.fnm", self.name))?,
        );
        fnm.write_vint(self.fields.len() as u32)?;

        let mut nrm = StructWriter::new(
            self.storage.create_output(&format!("{}.nrm", self.name))?,
        );
        // Header and format specifier.
        nrm.write_bytes(b"NRM")?;
        nrm.write_byte(0xFF)?;

        let default_norm = similarity::encode_norm(similarity::length_norm(0));
        for field in &self.fields {
            fnm.write_string(&field.name)?;
            fnm.write_byte(field.flag_bits())?;

            if field.is_indexed {
                let mut vector = self.norms.get(&field.name).cloned().unwrap_or_default();
                vector.resize(self.doc_count as usize, default_norm);
                nrm.write_bytes(&vector)?;
            }
        }

        fnm.close()?;
        nrm.close()?;

        self.files.push(format!("{}.fnm", self.name));
        self.files.push(format!("{}.nrm", self.name));

        Ok(())
    }

    /// Pack all component files into the compound (`.cfs`) file and delete
    /// the loose files.
    pub fn generate_cfs(&mut self) -> Result<()> {
        // Close remaining member writers so their bytes are on storage.
        for writer in [
            self.fdx.take(),
            self.fdt.take(),
            self.tis.take(),
            self.tii.take(),
            self.frq.take(),
            self.prx.take(),
        ]
        .into_iter()
        .flatten()
        {
            writer.close()?;
        }

        let mut cfs = StructWriter::new(
            self.storage.create_output(&format!("{}.cfs", self.name))?,
        );
        cfs.write_vint(self.files.len() as u32)?;

        let mut offset_pointers = Vec::with_capacity(self.files.len());
        for file_name in &self.files {
            offset_pointers.push(cfs.tell());
            cfs.write_u64(0)?; // dummy data
            cfs.write_string(file_name)?;
        }

        for (idx, file_name) in self.files.iter().enumerate() {
            let data_offset = cfs.tell();
            cfs.seek_to(offset_pointers[idx])?;
            cfs.write_u64(data_offset)?;
            cfs.seek_to(data_offset)?;

            let mut input = self.storage.open_input(file_name)?;
            let mut remaining = self.storage.file_size(file_name)?;
            let mut buffer = vec![0u8; CFS_COPY_CHUNK];
            while remaining > 0 {
                let chunk = remaining.min(CFS_COPY_CHUNK as u64) as usize;
                std::io::Read::read_exact(&mut input, &mut buffer[..chunk])?;
                cfs.write_bytes(&buffer[..chunk])?;
                remaining -= chunk as u64;
            }

            self.storage.delete_file(file_name)?;
        }

        cfs.close()?;
        Ok(())
    }
}

/// Dump one term dictionary entry, shared between the `.tis` and `.tii`
/// files.
///
/// The prefix shared with the previous term is counted in characters and
/// never splits a multi-byte UTF-8 code point; pointers are delta-coded
/// against the previous entry of the same file.
fn dump_term_dict_entry(
    dic_file: &mut StructWriter,
    prev_term: &mut Option<(u32, String)>,
    prev_term_info: &mut Option<TermInfo>,
    field_num: u32,
    text: &str,
    term_info: &TermInfo,
) -> Result<()> {
    match prev_term {
        Some((prev_field, prev_text)) if *prev_field == field_num => {
            let (prefix_chars, prefix_bytes) = common_prefix(prev_text, text);
            dic_file.write_vint(prefix_chars as u32)?;
            dic_file.write_string(&text[prefix_bytes..])?;
        }
        _ => {
            dic_file.write_vint(0)?;
            dic_file.write_string(text)?;
        }
    }
    dic_file.write_vint(field_num)?;
    dic_file.write_vint(term_info.doc_freq)?;

    *prev_term = Some((field_num, text.to_string()));

    match prev_term_info {
        Some(prev_info) => {
            dic_file.write_vlong(term_info.freq_pointer - prev_info.freq_pointer)?;
            dic_file.write_vlong(term_info.prox_pointer - prev_info.prox_pointer)?;
        }
        None => {
            dic_file.write_vlong(term_info.freq_pointer)?;
            dic_file.write_vlong(term_info.prox_pointer)?;
        }
    }

    // Non-zero only when doc freq reaches the skip interval.
    if term_info.skip_offset != 0 {
        dic_file.write_vint(term_info.skip_offset)?;
    }

    *prev_term_info = Some(term_info.clone());

    Ok(())
}
