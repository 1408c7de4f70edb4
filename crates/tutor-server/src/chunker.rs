/// Splits documents into bounded, overlapping chunks.
///
/// Sizes are counted in chars. A chunk is at most `size` long; consecutive chunks of one
/// document share exactly `overlap` chars. Where possible a chunk ends just after a
/// paragraph break, line break, sentence end or space (in that order of preference)
/// instead of at the hard size limit.
use tracing::debug;

use crate::error::AppError;
use crate::model::{Chunk, Document};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

const SEPARATORS: [&str; 6] = ["\n\n", "\n", ". ", "? ", "! ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self, AppError> {
        if size == 0 || overlap >= size {
            return Err(AppError::Config(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Chunk every document, keeping each chunk's source tag.
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| {
                self.split_text(&doc.text)
                    .into_iter()
                    .enumerate()
                    .map(|(index, (start, text))| Chunk {
                        source: doc.source.clone(),
                        text,
                        index,
                        start,
                    })
            })
            .collect();
        debug!(
            documents = documents.len(),
            chunks = chunks.len(),
            "split documents"
        );
        chunks
    }

    /// Split one text into `(start_offset, chunk_text)` pairs.
    pub fn split_text(&self, text: &str) -> Vec<(usize, String)> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut out = Vec::new();
        if len == 0 {
            return out;
        }

        let mut start = 0;
        loop {
            let hard_end = (start + self.size).min(len);
            let end = if hard_end == len {
                len
            } else {
                self.boundary_end(&chars, start, hard_end)
            };
            out.push((start, chars[start..end].iter().collect()));
            if end == len {
                break;
            }
            start = end - self.overlap;
        }
        out
    }

    /// The latest preferred separator end in `(start + max(overlap, size / 2), hard_end]`,
    /// or `hard_end` when there is none.
    fn boundary_end(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let min_end = start + self.overlap.max(self.size / 2) + 1;
        for sep in SEPARATORS {
            let sep: Vec<char> = sep.chars().collect();
            let mut end = hard_end;
            while end >= min_end && end >= start + sep.len() {
                if chars[end - sep.len()..end] == sep[..] {
                    return end;
                }
                end -= 1;
            }
        }
        hard_end
    }
}
