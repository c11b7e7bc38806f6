//! Term dictionary index loading.
//!
//! The `.tii` file holds a sparse sample of every `index_interval`-th term
//! dictionary entry, prefix-compressed like the main dictionary but with an
//! extra delta-coded pointer back into the `.tis` file. The parsed index is
//! cached to a `.sti` file so later opens skip the decode.

use serde::{Deserialize, Serialize};

use crate::error::{KontosError, Result};
use crate::index::term::{TermInfo, prefix_by_chars};
use crate::storage::StructReader;

/// One sampled dictionary entry.
///
/// The leading entry of every index is a synthetic empty term with field
/// number -1 that points at the first real dictionary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTerm {
    /// Field number, or -1 for the leading synthetic entry.
    pub field_num: i32,

    /// Term text.
    pub text: String,
}

/// The parsed dictionary index of one segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionaryIndex {
    /// Sampled terms in dictionary order.
    pub terms: Vec<IndexTerm>,

    /// The sampled terms' records; `index_pointer` is always present.
    pub infos: Vec<TermInfo>,

    /// Index interval of the segment dictionary.
    pub index_interval: u32,

    /// Skip interval of the segment dictionary.
    pub skip_interval: u32,
}

impl DictionaryIndex {
    /// Number of sampled entries.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Parse a `.tii` stream into a [`DictionaryIndex`].
pub fn load(reader: &mut StructReader) -> Result<DictionaryIndex> {
    let marker = reader.read_u32()?;
    let is_21_format = match marker {
        0xFFFF_FFFD => true,
        0xFFFF_FFFE => false,
        _ => {
            return Err(KontosError::invalid_file_format(
                "Wrong TermInfoIndex file format",
            ));
        }
    };

    let term_count = reader.read_u64()?;
    let index_interval = reader.read_u32()?;
    let skip_interval = reader.read_u32()?;
    if is_21_format {
        let _max_skip_levels = reader.read_u32()?;
    }

    let mut index = DictionaryIndex {
        terms: Vec::with_capacity(term_count as usize),
        infos: Vec::with_capacity(term_count as usize),
        index_interval,
        skip_interval,
    };

    let mut prev_text = String::new();
    let mut freq_pointer = 0u64;
    let mut prox_pointer = 0u64;
    let mut index_pointer = 0u64;

    for _ in 0..term_count {
        let prefix_length = reader.read_vint()? as usize;
        let suffix = reader.read_string()?;
        let field_num = reader.read_vint()? as i32;

        let mut text = prefix_by_chars(&prev_text, prefix_length).to_string();
        text.push_str(&suffix);

        let doc_freq = reader.read_vint()?;
        freq_pointer += reader.read_vlong()?;
        prox_pointer += reader.read_vlong()?;
        let skip_offset = if doc_freq >= skip_interval {
            reader.read_vint()?
        } else {
            0
        };
        index_pointer += reader.read_vlong()?;

        index.terms.push(IndexTerm {
            field_num,
            text: text.clone(),
        });
        index.infos.push(TermInfo {
            doc_freq,
            freq_pointer,
            prox_pointer,
            skip_offset,
            index_pointer: Some(index_pointer),
        });

        prev_text = text;
    }

    Ok(index)
}
