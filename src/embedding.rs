//! Embedding service adapters and the order-preserving batch client.
//!
//! [`EmbeddingService`] is the seam to the external model: one call, one
//! round trip, vectors returned in input order. [`EmbeddingClient`] sits on
//! top and turns arbitrarily large inputs into sub-batches, runs them on a
//! bounded thread pool, and isolates failures per item.

use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    document::Embedding,
    error::{Error, Result},
    http::{JsonClient, join_url},
};

/// Default embedding model served by the embedding endpoint.
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Output dimension of [`DEFAULT_MODEL`].
pub const DEFAULT_DIMENSION: usize = 384;

/// Default number of texts per request to the embedding service.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default number of sub-batches in flight at once.
pub const DEFAULT_PARALLELISM: usize = 4;

const SERVICE: &str = "embedding service";

/// A text embedding backend.
pub trait EmbeddingService: Send + Sync {
    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;

    /// Embed `texts` in a single round trip.
    ///
    /// Implementations return exactly one vector per input, in order, or
    /// fail the whole call.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

impl<T: EmbeddingService + ?Sized> EmbeddingService for Box<T> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed(texts)
    }
}

// -- HTTP service --

/// Client for OpenAI-compatible `/v1/embeddings` endpoints.
///
/// Works against any server speaking that wire format (text-embeddings
/// inference servers, local model gateways, hosted APIs).
pub struct HttpEmbedder {
    http: JsonClient,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Create a client for the service at `base_url`.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: JsonClient::new(SERVICE, timeout)?,
            url: join_url(base_url, "v1/embeddings"),
            model: model.into(),
        })
    }
}

impl EmbeddingService for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let response: EmbeddingResponse = self.http.post(&self.url, &request)?;
        decode_vectors(response, texts.len())
    }
}

/// Put response vectors back into request order.
fn decode_vectors(
    response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>> {
    let malformed = |message: String| Error::MalformedResponse {
        service: SERVICE,
        message,
    };

    if response.data.len() != expected {
        return Err(malformed(format!(
            "expected {expected} embeddings, got {}",
            response.data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for datum in response.data {
        let Some(slot) = slots.get_mut(datum.index) else {
            return Err(malformed(format!(
                "embedding index {} out of range",
                datum.index
            )));
        };
        if slot.is_some() {
            return Err(malformed(format!(
                "duplicate embedding index {}",
                datum.index
            )));
        }
        *slot = Some(datum.embedding);
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| malformed("missing embedding index".into()))
}

// -- Hash service --

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

/// Deterministic feature-hashing embedder.
///
/// Hashes character 3- and 4-grams into a fixed number of signed buckets
/// and L2-normalizes the result. Texts sharing vocabulary land close to
/// each other, which is enough for offline runs and tests; it is not a
/// semantic model.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::Config(
                "embedding dimension must be positive".into(),
            ));
        }
        Ok(Self {
            dimension,
            model: format!("fnv1a-hash-{dimension}"),
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for n in 3..=4 {
            for window in chars.windows(n) {
                let gram: String = window.iter().collect();
                let h = fnv1a(gram.as_bytes());
                let bucket = (h % self.dimension as u64) as usize;
                let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingService for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// -- Batch client --

/// Batching knobs for [`EmbeddingClient`].
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingOptions {
    /// Expected vector dimension; anything else is rejected.
    pub dimension: usize,
    /// Maximum texts per call to the service.
    pub batch_size: usize,
    /// Maximum sub-batches in flight at once.
    pub parallelism: usize,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// Order-preserving, failure-isolating front end to an embedding service.
///
/// # Examples
///
/// ```
/// use docrag::embedding::{EmbeddingClient, EmbeddingOptions, HashEmbedder};
///
/// let options = EmbeddingOptions { dimension: 32, ..Default::default() };
/// let client =
///     EmbeddingClient::new(HashEmbedder::new(32).unwrap(), options).unwrap();
///
/// let texts = vec!["first".to_string(), "second".to_string()];
/// let results = client.embed_batch(&texts);
/// assert_eq!(results.len(), 2);
/// assert!(results.iter().all(|r| r.is_ok()));
/// ```
pub struct EmbeddingClient<S> {
    service: S,
    options: EmbeddingOptions,
    pool: rayon::ThreadPool,
}

impl<S: EmbeddingService> EmbeddingClient<S> {
    pub fn new(service: S, options: EmbeddingOptions) -> Result<Self> {
        if options.dimension == 0 {
            return Err(Error::Config(
                "embedding dimension must be positive".into(),
            ));
        }
        if options.batch_size == 0 {
            return Err(Error::Config(
                "embedding batch size must be positive".into(),
            ));
        }
        if options.parallelism == 0 {
            return Err(Error::Config(
                "embedding parallelism must be positive".into(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.parallelism)
            .thread_name(|i| format!("docrag-embed-{i}"))
            .build()
            .map_err(|e| {
                Error::Config(format!("cannot start embedding workers: {e}"))
            })?;

        Ok(Self {
            service,
            options,
            pool,
        })
    }

    pub fn dimension(&self) -> usize {
        self.options.dimension
    }

    pub fn model_id(&self) -> &str {
        self.service.model_id()
    }

    /// Embed every text, returning one result per input in input order.
    ///
    /// A failure on one item never prevents the others from succeeding,
    /// except when the service itself is unreachable: then every item of
    /// the affected sub-batch carries the error.
    pub fn embed_batch(&self, texts: &[String]) -> Vec<Result<Embedding>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let per_batch: Vec<Vec<Result<Embedding>>> = self.pool.install(|| {
            texts
                .par_chunks(self.options.batch_size)
                .map(|batch| self.embed_sub_batch(batch))
                .collect()
        });

        per_batch.into_iter().flatten().collect()
    }

    /// Embed a single query text.
    pub fn embed_query(&self, text: &str) -> Result<Embedding> {
        self.embed_single(text)
    }

    fn embed_sub_batch(&self, batch: &[String]) -> Vec<Result<Embedding>> {
        match self.service.embed(batch) {
            Ok(vectors) if vectors.len() == batch.len() => {
                vectors.into_iter().map(|v| self.wrap(v)).collect()
            }
            Ok(vectors) => {
                let err = Error::MalformedResponse {
                    service: SERVICE,
                    message: format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        vectors.len()
                    ),
                };
                self.isolate(batch, err)
            }
            Err(err) => self.isolate(batch, err),
        }
    }

    /// Recover per-item results after a sub-batch call failed.
    fn isolate(&self, batch: &[String], err: Error) -> Vec<Result<Embedding>> {
        if batch.len() == 1 {
            return vec![Err(err)];
        }

        if err.is_transient() {
            warn!(items = batch.len(), "embedding sub-batch failed: {err}");
            let message = err.to_string();
            return batch
                .iter()
                .map(|_| Err(Error::Embedding(message.clone())))
                .collect();
        }

        debug!(
            items = batch.len(),
            "embedding sub-batch rejected ({err}), retrying items one by one"
        );
        batch.iter().map(|text| self.embed_single(text)).collect()
    }

    fn embed_single(&self, text: &str) -> Result<Embedding> {
        let input = [text.to_string()];
        let mut vectors = self.service.embed(&input)?;
        match (vectors.pop(), vectors.is_empty()) {
            (Some(vector), true) => self.wrap(vector),
            _ => Err(Error::MalformedResponse {
                service: SERVICE,
                message: "expected exactly one embedding".into(),
            }),
        }
    }

    fn wrap(&self, vector: Vec<f32>) -> Result<Embedding> {
        Embedding::new(vector, self.options.dimension, self.service.model_id())
    }
}
