//! Immutable value types flowing through indexing and search.

use serde::Serialize;

use crate::{
    doc_id::ChunkId,
    error::{Error, Result},
};

/// A fixed-dimension vector produced by an embedding model.
///
/// # Examples
///
/// ```
/// use docrag::Embedding;
///
/// let e = Embedding::new(vec![0.6, 0.8], 2, "toy-model").unwrap();
/// assert_eq!(e.dimension(), 2);
///
/// // A vector of the wrong size is rejected, never truncated.
/// assert!(Embedding::new(vec![1.0, 0.0, 0.0], 2, "toy-model").is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    vector: Vec<f32>,
    model: String,
}

impl Embedding {
    /// Build an embedding, checking it against the expected dimension.
    pub fn new(
        vector: Vec<f32>,
        dimension: usize,
        model: impl Into<String>,
    ) -> Result<Self> {
        if vector.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
            return Err(Error::Embedding(format!(
                "component {pos} is not a finite number"
            )));
        }
        Ok(Self {
            vector,
            model: model.into(),
        })
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Identifier of the model that produced this vector.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Euclidean norm of the vector.
    pub fn norm(&self) -> f32 {
        self.vector.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// One chunk of a source document, the unit of embedding and retrieval.
///
/// Documents are never mutated. Attaching an embedding consumes the value
/// and returns a new one with the same id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    id: ChunkId,
    content: String,
    source: String,
    chunk_index: usize,
    total_chunks: Option<usize>,
    #[serde(skip)]
    embedding: Option<Embedding>,
}

impl Document {
    /// Create a chunk with a generated id.
    ///
    /// Content that is empty or whitespace-only is rejected.
    pub fn new(
        source: impl Into<String>,
        chunk_index: usize,
        content: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        let id = ChunkId::new(&source, chunk_index);
        Self::with_id(id, source, chunk_index, content)
    }

    /// Create a chunk with an id assigned elsewhere (e.g. read back from a
    /// vector store).
    pub fn with_id(
        id: ChunkId,
        source: impl Into<String>,
        chunk_index: usize,
        content: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        let content = content.into();
        if content.trim().is_empty() {
            return Err(Error::Ingestion {
                document: source,
                reason: format!("chunk {chunk_index} has no content"),
            });
        }
        Ok(Self {
            id,
            content,
            source,
            chunk_index,
            total_chunks: None,
            embedding: None,
        })
    }

    /// Record how many chunks the source was split into.
    pub fn with_total_chunks(self, total_chunks: usize) -> Self {
        Self {
            total_chunks: Some(total_chunks),
            ..self
        }
    }

    /// Attach an embedding, producing a new value with the same id.
    pub fn with_embedding(self, embedding: Embedding) -> Self {
        Self {
            embedding: Some(embedding),
            ..self
        }
    }

    /// The same chunk with its embedding dropped.
    pub fn without_embedding(self) -> Self {
        Self {
            embedding: None,
            ..self
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    pub fn total_chunks(&self) -> Option<usize> {
        self.total_chunks
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        self.embedding.as_ref()
    }
}
