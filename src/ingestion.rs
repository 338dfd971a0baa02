use std::path::Path;

use rayon::prelude::*;

use crate::{
    chunking::{ChunkingConfig, chunk_document},
    document::Document,
    error::{Error, Result},
    walker::{DiscoveredFile, is_supported},
};

/// Files read concurrently before their chunks are handed on.
pub const READ_WINDOW: usize = 32;

/// One source file after reading and chunking.
#[derive(Debug)]
pub struct LoadedSource {
    pub source: String,
    /// The file's chunks, or why the file cannot be indexed.
    pub chunks: Result<Vec<Document>>,
}

/// Read a document file as UTF-8 text.
///
/// # Errors
///
/// [`Error::UnsupportedFormat`] for extensions other than md, markdown
/// and txt. [`Error::Ingestion`] when the bytes are not valid UTF-8 or
/// the file holds only whitespace.
pub fn read_document(path: &Path) -> Result<String> {
    if !is_supported(path) {
        return Err(Error::UnsupportedFormat(path.to_path_buf()));
    }

    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|e| Error::Ingestion {
        document: path.display().to_string(),
        reason: format!(
            "not valid UTF-8 (invalid byte at offset {})",
            e.utf8_error().valid_up_to()
        ),
    })?;

    if text.trim().is_empty() {
        return Err(Error::Ingestion {
            document: path.display().to_string(),
            reason: "file is empty".into(),
        });
    }
    Ok(text)
}

/// Read and chunk one window of files.
///
/// Files are read in parallel; the output keeps the input order. A file
/// that cannot be read, decoded or chunked yields an error entry instead
/// of failing its neighbours.
pub fn load_sources(
    files: &[DiscoveredFile],
    config: &ChunkingConfig,
) -> Vec<LoadedSource> {
    files
        .par_iter()
        .map(|file| {
            let source = file.source();
            let chunks = read_document(&file.absolute_path)
                .and_then(|text| chunk_document(&source, &text, config));
            LoadedSource { source, chunks }
        })
        .collect()
}
