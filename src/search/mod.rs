//! Scoring collaborators consumed by the index storage engine.

pub mod similarity;
