//! docrag - hybrid semantic and keyword retrieval for RAG pipelines.
//!
//! docrag chunks markdown and text files, embeds the chunks through an
//! external embedding service and stores them in an external vector store
//! (a [Chroma](https://www.trychroma.com/) server, or the in-memory store).
//! Queries fuse vector similarity with a keyword score computed over the
//! retrieved candidates, spread results across source documents and flag
//! result sets that fall below the confidence threshold.
//!
//! # Quick start
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use docrag::{
//!     Indexer,
//!     SearchConfig,
//!     Searcher,
//!     chroma::{ChromaOptions, ChromaStore},
//!     embedding::{EmbeddingClient, EmbeddingOptions, HashEmbedder},
//!     indexing::IndexOptions,
//!     vector_store::{DistanceMetric, RetryPolicy, VectorStoreClient},
//! };
//!
//! let options = EmbeddingOptions { dimension: 256, ..Default::default() };
//! let embedder =
//!     EmbeddingClient::new(HashEmbedder::new(256).unwrap(), options).unwrap();
//! let store = VectorStoreClient::new(
//!     ChromaStore::connect(&ChromaOptions::default()).unwrap(),
//!     DistanceMetric::CosineDistance,
//!     RetryPolicy::default(),
//! );
//!
//! let indexer = Indexer::new(&embedder, &store, IndexOptions::default()).unwrap();
//! let progress = indexer.index(&[PathBuf::from("notes")]);
//! println!("indexed {} documents", progress.processed);
//!
//! let results = Searcher::new(&embedder, &store)
//!     .search("rust ownership", &SearchConfig::default())
//!     .unwrap();
//! for r in &results {
//!     println!("{} (score: {:.3})", r.source(), r.combined_score);
//! }
//! ```

pub mod chroma;
pub mod chunking;
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod doc_id;
pub mod document;
pub mod embedding;
pub mod error;
pub mod fusion;
mod http;
pub mod indexing;
pub mod ingestion;
pub mod keyword;
pub mod memory_store;
pub mod progress;
pub mod search;
pub mod vector_store;
pub mod walker;

pub use doc_id::ChunkId;
pub use document::{Document, Embedding};
pub use error::{Error, Result};
pub use indexing::{CancelFlag, Indexer};
pub use progress::{IndexStatus, IndexingProgress};
pub use search::{OutputShape, SearchConfig, SearchResult, Searcher};
