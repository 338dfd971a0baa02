use serde::{Deserialize, Serialize};

/// Length of the hex form of a generated chunk id.
const ID_HEX_LEN: usize = 32;

/// Length of the abbreviated id shown to humans.
const SHORT_LEN: usize = 8;

/// A stable chunk identifier derived from (source, chunk_index).
///
/// Generated ids are the first 128 bits of a blake3 digest in hex, so the
/// same source and position map to the same id on every run and every
/// build. That is what makes re-indexing an overwrite instead of an
/// accumulation of duplicates.
///
/// Ids read back from a vector store are wrapped as-is with
/// [`ChunkId::from_raw`]; they are only compared and displayed.
///
/// # Examples
///
/// ```
/// use docrag::ChunkId;
///
/// let a = ChunkId::new("notes/rust.md", 0);
/// let b = ChunkId::new("notes/rust.md", 0);
/// assert_eq!(a, b);
/// assert_ne!(a, ChunkId::new("notes/rust.md", 1));
/// ```
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Generate the id for chunk `chunk_index` of `source`.
    pub fn new(source: &str, chunk_index: usize) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_bytes());
        // Separator keeps ("ab", 1) and ("a", b1) apart.
        hasher.update(&[0]);
        hasher.update(&(chunk_index as u64).to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..ID_HEX_LEN].to_string())
    }

    /// Wrap an id that came from elsewhere, typically the vector store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for terminal output.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_LEN)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
