use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a piece of text came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceTag {
    /// The subject syllabus, rendered as `SYLLABUS`.
    Syllabus,
    /// A notes file, rendered as `NOTES:<filename>`.
    Notes(String),
}

impl SourceTag {
    pub fn is_syllabus(&self) -> bool {
        matches!(self, Self::Syllabus)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syllabus => f.write_str("SYLLABUS"),
            Self::Notes(name) => write!(f, "NOTES:{name}"),
        }
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "SYLLABUS" {
            return Ok(Self::Syllabus);
        }
        s.strip_prefix("NOTES:")
            .map(|name| Self::Notes(name.trim_start().to_string()))
            .ok_or_else(|| format!("unrecognized source tag: {s}"))
    }
}

/// A loaded source file. Immutable after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub source: SourceTag,
    pub text: String,
}

/// A bounded, overlapping slice of a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source: SourceTag,
    pub text: String,
    /// Position of this chunk within its document
    pub index: usize,
    /// Char offset of the chunk start within its document
    pub start: usize,
}

/// A chunk returned from retrieval, with its similarity score (higher is more relevant).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// One record extracted from a numbered answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredItem {
    pub question_number: String,
    pub content: String,
}
