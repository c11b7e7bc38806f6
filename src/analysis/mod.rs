//! Text analysis: tokens and analyzers.
//!
//! The index write path consumes token streams produced by an [`Analyzer`].
//! Analysis is an external collaborator of the storage engine; only the
//! minimal contract lives here, together with a simple alphabetic-run
//! analyzer good enough for tests and small applications.

/// A token represents a single unit of text after tokenization.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The text content of the token.
    pub text: String,

    /// The byte offset where this token starts in the original text.
    pub start_offset: usize,

    /// The byte offset where this token ends in the original text.
    pub end_offset: usize,

    /// Position relative to the previous token (default: 1).
    pub position_increment: u32,
}

impl Token {
    /// Create a new token with offsets and the default position increment.
    pub fn new<S: Into<String>>(text: S, start_offset: usize, end_offset: usize) -> Self {
        Token {
            text: text.into(),
            start_offset,
            end_offset,
            position_increment: 1,
        }
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// A trait for analyzers that turn field text into a token stream.
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Tokenize the given text.
    fn tokenize(&self, text: &str) -> Vec<Token>;
}

/// A simple analyzer that extracts runs of alphabetic characters and
/// optionally lowercases them.
#[derive(Debug, Clone)]
pub struct TextAnalyzer {
    /// Whether tokens are lowercased.
    pub lowercase: bool,
}

impl TextAnalyzer {
    /// Create a new case-insensitive text analyzer.
    pub fn new() -> Self {
        TextAnalyzer { lowercase: true }
    }

    /// Create a case-sensitive text analyzer.
    pub fn case_sensitive() -> Self {
        TextAnalyzer { lowercase: false }
    }
}

impl Default for TextAnalyzer {
    fn default() -> Self {
        TextAnalyzer::new()
    }
}

impl Analyzer for TextAnalyzer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut start: Option<usize> = None;

        for (idx, ch) in text.char_indices() {
            if ch.is_alphabetic() {
                if start.is_none() {
                    start = Some(idx);
                }
            } else if let Some(s) = start.take() {
                tokens.push(self.make_token(text, s, idx));
            }
        }
        if let Some(s) = start {
            tokens.push(self.make_token(text, s, text.len()));
        }

        tokens
    }
}

impl TextAnalyzer {
    fn make_token(&self, text: &str, start: usize, end: usize) -> Token {
        let slice = &text[start..end];
        let token_text = if self.lowercase {
            slice.to_lowercase()
        } else {
            slice.to_string()
        };
        Token::new(token_text, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_simple() {
        let analyzer = TextAnalyzer::new();
        let tokens = analyzer.tokenize("Hello, World!");

        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "hello");
        assert_eq!(tokens[0].start_offset, 0);
        assert_eq!(tokens[0].end_offset, 5);
        assert_eq!(tokens[1].text, "world");
        assert_eq!(tokens[1].position_increment, 1);
    }

    #[test]
    fn test_tokenize_case_sensitive() {
        let analyzer = TextAnalyzer::case_sensitive();
        let tokens = analyzer.tokenize("Hello World");

        assert_eq!(tokens[0].text, "Hello");
        assert_eq!(tokens[1].text, "World");
    }

    #[test]
    fn test_tokenize_empty() {
        let analyzer = TextAnalyzer::new();
        assert!(analyzer.tokenize("").is_empty());
        assert!(analyzer.tokenize("123 456").is_empty());
    }
}
