//! Chunking utilities for splitting documents into overlapping segments.
//!
//! Each segment becomes one [`Document`] with a stable id, so the same
//! file always produces the same chunk boundaries and ids.

use crate::{
    document::Document,
    error::{Error, Result},
};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// How far back from the window end to look for whitespace.
const BOUNDARY_LOOKBACK: usize = 100;

/// Validated chunking parameters.
///
/// # Examples
///
/// ```
/// use docrag::chunking::ChunkingConfig;
///
/// assert!(ChunkingConfig::new(1000, 200).is_ok());
/// // Overlap must be strictly smaller than the chunk size.
/// assert!(ChunkingConfig::new(100, 100).is_err());
/// assert!(ChunkingConfig::new(0, 0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        if overlap >= chunk_size {
            return Err(Error::Config(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size \
                 ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// A chunk of text from a larger document.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The chunk text content.
    pub text: String,
    /// Zero-based index among the kept chunks of the document.
    pub index: usize,
    /// Byte offset where this chunk starts in the original document.
    pub start_offset: usize,
}

/// Split text into overlapping chunks.
///
/// Splitting is character based, so multi-byte text never gets cut in
/// the middle of a code point. Windows prefer to end just after the last
/// whitespace of their final stretch; the next window starts `overlap`
/// characters before the previous one ended. Blank windows are dropped
/// and indices stay dense over the chunks that are kept.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{ChunkingConfig, chunk_text};
///
/// let config = ChunkingConfig::new(1000, 200).unwrap();
///
/// let chunks = chunk_text("Hello, world!", &config);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].text, "Hello, world!");
///
/// let text = "word ".repeat(500);
/// let chunks = chunk_text(&text, &config);
/// assert!(chunks.len() >= 2);
/// ```
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let char_count = text.chars().count();

    // Map of char index -> byte index, with a sentinel for the end.
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut chunks = Vec::new();
    let mut start_char = 0;

    while start_char < char_count {
        let window_end = (start_char + config.chunk_size).min(char_count);
        let end_char = if window_end < char_count {
            find_word_boundary_char(text, &char_to_byte, start_char, window_end)
        } else {
            window_end
        };

        let start_byte = char_to_byte[start_char];
        let end_byte = char_to_byte[end_char];
        let piece = &text[start_byte..end_byte];

        if !piece.trim().is_empty() {
            chunks.push(Chunk {
                text: piece.to_string(),
                index: chunks.len(),
                start_offset: start_byte,
            });
        }

        if end_char >= char_count {
            break;
        }

        let next = end_char.saturating_sub(config.overlap);
        start_char = if next > start_char { next } else { end_char };
    }

    chunks
}

/// Find a break point at or before `pos_char`, just after whitespace.
///
/// Never returns a position at or before `start_char`, so the caller
/// always makes progress.
fn find_word_boundary_char(
    text: &str,
    char_to_byte: &[usize],
    start_char: usize,
    pos_char: usize,
) -> usize {
    let search_start_char =
        pos_char.saturating_sub(BOUNDARY_LOOKBACK).max(start_char + 1);
    if search_start_char >= pos_char {
        return pos_char;
    }

    let start_byte = char_to_byte[search_start_char];
    let end_byte = char_to_byte[pos_char];
    let search_region = &text[start_byte..end_byte];

    if let Some(ws_offset) = search_region.rfind(char::is_whitespace) {
        let ws_byte = start_byte + ws_offset;
        // First char that starts after the whitespace.
        return char_to_byte.partition_point(|&b| b <= ws_byte);
    }

    pos_char
}

/// Chunk a whole source document into [`Document`] values.
///
/// Every chunk carries the number of chunks its source produced.
///
/// # Errors
///
/// Returns [`Error::Ingestion`] if the text has no indexable content.
pub fn chunk_document(
    source: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Document>> {
    let chunks = chunk_text(text, config);
    if chunks.is_empty() {
        return Err(Error::Ingestion {
            document: source.to_string(),
            reason: "document has no indexable content".into(),
        });
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .map(|chunk| {
            Document::new(source, chunk.index, chunk.text)
                .map(|doc| doc.with_total_chunks(total))
        })
        .collect()
}
