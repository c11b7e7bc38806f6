//! # Kontos
//!
//! A single-writer/multi-reader full-text index storage engine compatible
//! with the classic Lucene segment file formats (pre-2.1 through 2.3).
//!
//! ## Features
//!
//! - Pure Rust implementation
//! - Bit-exact segment codec: term dictionary, postings, stored fields, norms
//! - Multi-way segment merging with doc-id compaction
//! - Generation-versioned commits with cooperative file cleanup
//! - Pluggable storage backends
//! - Advisory cross-process lock protocol

pub mod analysis;
pub mod document;
pub mod error;
pub mod index;
pub mod search;
pub mod storage;
pub mod util;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
