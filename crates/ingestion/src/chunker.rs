//! Text chunking module
//!
//! Splits page text into overlapping segments for embedding. Boundaries
//! follow the text-splitter semantic levels (paragraph, sentence, word,
//! grapheme) before falling back to hard character cuts.

use crate::errors::IngestionError;
use cevra_common::config::IngestionConfig;
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use tracing::debug;

/// Default target chunk size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default overlap between consecutive chunks in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// A text chunk with its position in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The chunk content
    pub content: String,
    /// Index of this chunk in the source text
    pub index: usize,
    /// Start byte offset in the source text
    pub start_pos: usize,
    /// End byte offset (exclusive)
    pub end_pos: usize,
}

/// Deterministic splitter; holds no state between calls
pub struct Chunker {
    splitter: TextSplitter<Characters>,
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IngestionError> {
        // Whitespace is kept so chunks tile the source text exactly
        let config = ChunkConfig::new(chunk_size)
            .with_overlap(chunk_overlap)
            .map_err(|e| IngestionError::ChunkConfig(e.to_string()))?
            .with_trim(false);

        Ok(Self {
            splitter: TextSplitter::new(config),
            chunk_size,
        })
    }

    pub fn from_config(config: &IngestionConfig) -> Result<Self, IngestionError> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split text into ordered chunks
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let chunks: Vec<TextChunk> = self
            .splitter
            .chunk_indices(text)
            .enumerate()
            .map(|(index, (offset, chunk))| TextChunk {
                content: chunk.to_string(),
                index,
                start_pos: offset,
                end_pos: offset + chunk.len(),
            })
            .collect();

        debug!(
            input_len = text.len(),
            chunk_count = chunks.len(),
            chunk_size = self.chunk_size,
            "Text chunked"
        );

        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            splitter: TextSplitter::new(
                ChunkConfig::new(DEFAULT_CHUNK_SIZE)
                    .with_overlap(DEFAULT_CHUNK_OVERLAP)
                    .unwrap_or_else(|_| ChunkConfig::new(DEFAULT_CHUNK_SIZE))
                    .with_trim(false),
            ),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}
