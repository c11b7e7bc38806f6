//! Documents and fields.
//!
//! A [`Document`] is an ordered collection of named [`Field`]s. Field flags
//! control whether a value is stored in the segment's field data files,
//! indexed into the term dictionary, and tokenized by the analyzer.

use serde::{Deserialize, Serialize};

/// The value stored in a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// UTF-8 text data.
    Text(String),

    /// Raw byte data.
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Return the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Binary(_) => None,
        }
    }

    /// Return the raw bytes of the value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(text) => text.as_bytes(),
            FieldValue::Binary(bytes) => bytes,
        }
    }
}

/// A named field with storage and indexing options.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// The field name.
    pub name: String,

    /// The field value.
    pub value: FieldValue,

    /// Whether the value is stored in the field data files.
    pub is_stored: bool,

    /// Whether the value is indexed into the term dictionary.
    pub is_indexed: bool,

    /// Whether the value is tokenized before indexing.
    pub is_tokenized: bool,

    /// Whether term vectors are stored for this field.
    pub store_term_vector: bool,

    /// Scoring boost applied to this field's norms.
    pub boost: f32,
}

impl Field {
    /// A stored, indexed, tokenized text field.
    pub fn text<S: Into<String>, V: Into<String>>(name: S, value: V) -> Self {
        Field {
            name: name.into(),
            value: FieldValue::Text(value.into()),
            is_stored: true,
            is_indexed: true,
            is_tokenized: true,
            store_term_vector: false,
            boost: 1.0,
        }
    }

    /// A stored, indexed, untokenized field (indexed as a single term).
    pub fn keyword<S: Into<String>, V: Into<String>>(name: S, value: V) -> Self {
        Field {
            name: name.into(),
            value: FieldValue::Text(value.into()),
            is_stored: true,
            is_indexed: true,
            is_tokenized: false,
            store_term_vector: false,
            boost: 1.0,
        }
    }

    /// A stored-only field, never indexed.
    pub fn un_indexed<S: Into<String>, V: Into<String>>(name: S, value: V) -> Self {
        Field {
            name: name.into(),
            value: FieldValue::Text(value.into()),
            is_stored: true,
            is_indexed: false,
            is_tokenized: false,
            store_term_vector: false,
            boost: 1.0,
        }
    }

    /// An indexed, tokenized field that is not stored.
    pub fn un_stored<S: Into<String>, V: Into<String>>(name: S, value: V) -> Self {
        Field {
            name: name.into(),
            value: FieldValue::Text(value.into()),
            is_stored: false,
            is_indexed: true,
            is_tokenized: true,
            store_term_vector: false,
            boost: 1.0,
        }
    }

    /// A stored-only binary field.
    pub fn binary<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Field {
            name: name.into(),
            value: FieldValue::Binary(value),
            is_stored: true,
            is_indexed: false,
            is_tokenized: false,
            store_term_vector: false,
            boost: 1.0,
        }
    }

    /// Set the field boost.
    pub fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    /// Whether the value is binary.
    pub fn is_binary(&self) -> bool {
        matches!(self.value, FieldValue::Binary(_))
    }
}

/// An ordered collection of fields with a document-level boost.
#[derive(Debug, Clone)]
pub struct Document {
    /// Scoring boost applied to all of this document's field norms.
    pub boost: f32,

    fields: Vec<Field>,
}

impl Default for Document {
    fn default() -> Self {
        Document::new()
    }
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document {
            boost: 1.0,
            fields: Vec::new(),
        }
    }

    /// Add a field to the document.
    pub fn add_field(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    /// Return the fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Return the first field with the given name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Return the names of all fields in insertion order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_constructors() {
        let field = Field::text("title", "Hello");
        assert!(field.is_stored && field.is_indexed && field.is_tokenized);

        let field = Field::keyword("id", "doc1");
        assert!(field.is_stored && field.is_indexed && !field.is_tokenized);

        let field = Field::un_indexed("raw", "payload");
        assert!(field.is_stored && !field.is_indexed);

        let field = Field::un_stored("body", "text");
        assert!(!field.is_stored && field.is_indexed && field.is_tokenized);

        let field = Field::binary("blob", vec![0, 1, 2]);
        assert!(field.is_binary() && field.is_stored && !field.is_indexed);
    }

    #[test]
    fn test_document_fields() {
        let mut doc = Document::new();
        doc.add_field(Field::text("title", "Hello"))
            .add_field(Field::keyword("id", "doc1"));

        assert_eq!(doc.fields().len(), 2);
        assert_eq!(doc.field_names(), vec!["title", "id"]);
        assert_eq!(
            doc.field("id").unwrap().value.as_text().unwrap(),
            "doc1"
        );
        assert!(doc.field("missing").is_none());
    }
}
