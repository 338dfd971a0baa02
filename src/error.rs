use std::{path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot ingest {document}: {reason}")]
    Ingestion { document: String, reason: String },

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("query cannot be empty")]
    EmptyQuery,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk {id} has no embedding")]
    MissingEmbedding { id: String },

    #[error("cannot reach {service}: {message}")]
    Connection {
        service: &'static str,
        message: String,
    },

    #[error("{service} did not answer within {after:?}")]
    Timeout {
        service: &'static str,
        after: Duration,
    },

    #[error("{service} returned HTTP {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("malformed response from {service}: {message}")]
    MalformedResponse {
        service: &'static str,
        message: String,
    },

    #[error("upsert stopped after {committed} of {total} sub-batches: {cause}")]
    PartialUpsert {
        committed: usize,
        total: usize,
        #[source]
        cause: Box<Error>,
    },

    #[error("keyword scoring failed: {0}")]
    Keyword(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{what} is unusable after a panic in another thread")]
    Poisoned { what: &'static str },
}

impl Error {
    /// Whether retrying the same call could succeed.
    ///
    /// Connectivity problems, timeouts and server-side HTTP errors are
    /// transient. Everything else (bad input, malformed payloads, client
    /// errors) fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Timeout { .. } => true,
            Error::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
