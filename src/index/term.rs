//! Terms and their dictionary records.

use serde::{Deserialize, Serialize};

/// A term represents a word from text. This is the unit of search. It is
/// composed of the text of the word and the name of the field the text
/// occurred in.
///
/// Terms may represent more than words from text fields: dates, email
/// addresses, urls and similar untokenized values are terms too.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Term {
    /// Field name.
    pub field: String,

    /// Term value.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Returns the term key: field name, a zero byte, then the term text.
    ///
    /// Keys order terms by (field, text) under plain byte comparison and
    /// are used for hashing and priority ordering.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.field.len() + 1 + self.text.len());
        key.extend_from_slice(self.field.as_bytes());
        key.push(0);
        key.extend_from_slice(self.text.as_bytes());
        key
    }
}

/// Return the prefix of `text` that is `length` characters long.
pub fn prefix_by_chars(text: &str, length: usize) -> &str {
    match text.char_indices().nth(length) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Compute the longest common prefix of two strings that does not split a
/// multi-byte UTF-8 code point.
///
/// Returns the prefix length in characters and in bytes.
pub fn common_prefix(prev: &str, current: &str) -> (usize, usize) {
    let prev_bytes = prev.as_bytes();
    let current_bytes = current.as_bytes();
    let max_bytes = prev_bytes.len().min(current_bytes.len());

    let mut matched_bytes = 0;
    while matched_bytes < max_bytes && prev_bytes[matched_bytes] == current_bytes[matched_bytes] {
        matched_bytes += 1;
    }

    // Walk whole characters of `current` up to the matched byte count; a
    // character crossing the boundary is excluded.
    let mut prefix_bytes = 0;
    let mut prefix_chars = 0;
    for ch in current.chars() {
        let char_bytes = ch.len_utf8();
        if prefix_bytes + char_bytes > matched_bytes {
            break;
        }
        prefix_chars += 1;
        prefix_bytes += char_bytes;
    }

    (prefix_chars, prefix_bytes)
}

/// A record of information stored for a term in the dictionary.
///
/// On disk these are delta-coded against the previous dictionary entry; in
/// memory they are absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInfo {
    /// The number of documents which contain the term.
    pub doc_freq: u32,

    /// Data offset in the frequencies file.
    pub freq_pointer: u64,

    /// Data offset in the positions file.
    pub prox_pointer: u64,

    /// Skip data offset within the frequencies file.
    pub skip_offset: u32,

    /// Offset of the *next* term in the dictionary file. Only present for
    /// dictionary index entries.
    pub index_pointer: Option<u64>,
}

impl TermInfo {
    /// Create a new term info record without an index pointer.
    pub fn new(doc_freq: u32, freq_pointer: u64, prox_pointer: u64, skip_offset: u32) -> Self {
        TermInfo {
            doc_freq,
            freq_pointer,
            prox_pointer,
            skip_offset,
            index_pointer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        let a = Term::new("author", "smith");
        let b = Term::new("title", "apple");
        let c = Term::new("title", "banana");

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Term::new("author", "smith"));
    }

    #[test]
    fn test_key_matches_ordering() {
        let terms = [
            Term::new("author", "smith"),
            Term::new("title", "apple"),
            Term::new("title", "banana"),
        ];

        for pair in terms.windows(2) {
            assert!(pair[0].key() < pair[1].key());
        }
    }

    #[test]
    fn test_key_layout() {
        let term = Term::new("f", "ab");
        assert_eq!(term.key(), vec![b'f', 0, b'a', b'b']);
    }

    #[test]
    fn test_prefix_by_chars() {
        assert_eq!(prefix_by_chars("hello", 3), "hel");
        assert_eq!(prefix_by_chars("hello", 10), "hello");
        assert_eq!(prefix_by_chars("héllo", 2), "hé");
        assert_eq!(prefix_by_chars("日本語", 2), "日本");
        assert_eq!(prefix_by_chars("", 5), "");
    }

    #[test]
    fn test_common_prefix_ascii() {
        assert_eq!(common_prefix("hello", "help"), (3, 3));
        assert_eq!(common_prefix("abc", "xyz"), (0, 0));
        assert_eq!(common_prefix("same", "same"), (4, 4));
        assert_eq!(common_prefix("", "abc"), (0, 0));
    }

    #[test]
    fn test_common_prefix_does_not_split_code_points() {
        // "日" and "旦" share their first two UTF-8 bytes but are different
        // characters; the common prefix must not include the partial char.
        let a = "日本";
        let b = "旦本";
        assert_eq!(&a.as_bytes()[..2], &b.as_bytes()[..2]);
        assert_eq!(common_prefix(a, b), (0, 0));

        assert_eq!(common_prefix("日本語", "日本人"), (2, 6));
    }
}
