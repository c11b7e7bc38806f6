//! Per-field metadata.

/// Flag bit: the field is indexed.
pub const FIELD_INDEXED: u8 = 0x01;
/// Flag bit: term vectors are stored for the field.
pub const FIELD_TERM_VECTOR: u8 = 0x02;
/// Flag bit: norms are omitted for the indexed field.
pub const FIELD_NORMS_OMITTED: u8 = 0x10;
/// Flag bit: payloads are stored with the field's positions.
pub const FIELD_PAYLOADS_STORED: u8 = 0x20;

/// Metadata for one field of a segment.
///
/// Field numbers are assigned per segment in registration order; dictionary
/// ordering uses the alphabetical rank of the field name instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,

    /// Field number within the segment.
    pub number: u32,

    /// Whether the field is indexed.
    pub is_indexed: bool,

    /// Whether term vectors are stored.
    pub store_term_vector: bool,

    /// Whether norms are omitted.
    pub norms_omitted: bool,

    /// Whether payloads are stored.
    pub payloads_stored: bool,
}

impl FieldInfo {
    /// Create a new field info record.
    pub fn new<S: Into<String>>(
        name: S,
        number: u32,
        is_indexed: bool,
        store_term_vector: bool,
    ) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            is_indexed,
            store_term_vector,
            norms_omitted: false,
            payloads_stored: false,
        }
    }

    /// Build a field info record from `.fnm` flag bits.
    pub fn from_flag_bits<S: Into<String>>(name: S, number: u32, bits: u8) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            is_indexed: bits & FIELD_INDEXED != 0,
            store_term_vector: bits & FIELD_TERM_VECTOR != 0,
            norms_omitted: bits & FIELD_NORMS_OMITTED != 0,
            payloads_stored: bits & FIELD_PAYLOADS_STORED != 0,
        }
    }

    /// Return the `.fnm` flag bits for this field.
    pub fn flag_bits(&self) -> u8 {
        let mut bits = 0;
        if self.is_indexed {
            bits |= FIELD_INDEXED;
        }
        if self.store_term_vector {
            bits |= FIELD_TERM_VECTOR;
        }
        if self.norms_omitted {
            bits |= FIELD_NORMS_OMITTED;
        }
        if self.payloads_stored {
            bits |= FIELD_PAYLOADS_STORED;
        }
        bits
    }
}
