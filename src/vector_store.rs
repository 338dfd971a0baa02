//! Vector store seam and the client the orchestrators talk to.
//!
//! [`VectorStore`] is one round trip to the backing service.
//! [`VectorStoreClient`] adds what every backend needs on top: splitting
//! upserts under the per-call item limit, bounded retries on transient
//! failures, and converting raw distances into similarities.

use std::{collections::BTreeSet, thread, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    doc_id::ChunkId,
    document::{Document, Embedding},
    error::{Error, Result},
};

/// Items per upsert call accepted by the reference store.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 5000;

/// A backing approximate nearest neighbour service.
pub trait VectorStore: Send + Sync {
    /// Largest number of documents a single [`upsert`](Self::upsert)
    /// call accepts.
    fn max_batch_size(&self) -> usize;

    /// Insert or overwrite `documents` in one call. Every document
    /// carries an embedding and the batch never exceeds
    /// [`max_batch_size`](Self::max_batch_size).
    fn upsert(&self, documents: &[Document]) -> Result<()>;

    /// Up to `k` nearest neighbours of `vector`, closest first, with the
    /// store's raw distance.
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Fetch one chunk, including its embedding when the store keeps it.
    fn get(&self, id: &ChunkId) -> Result<Option<Document>>;

    /// Number of chunks in the collection.
    fn count(&self) -> Result<usize>;

    /// Remove the given chunks. Unknown ids are ignored. The batch never
    /// exceeds [`max_batch_size`](Self::max_batch_size).
    fn delete(&self, ids: &[ChunkId]) -> Result<()>;

    /// Remove every chunk in the collection.
    fn clear(&self) -> Result<()>;

    /// Distinct `source` values of the stored chunks.
    fn sources(&self) -> Result<BTreeSet<String>>;
}

impl<T: VectorStore + ?Sized> VectorStore for Box<T> {
    fn max_batch_size(&self) -> usize {
        (**self).max_batch_size()
    }

    fn upsert(&self, documents: &[Document]) -> Result<()> {
        (**self).upsert(documents)
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        (**self).query(vector, k)
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Document>> {
        (**self).get(id)
    }

    fn count(&self) -> Result<usize> {
        (**self).count()
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<()> {
        (**self).delete(ids)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn sources(&self) -> Result<BTreeSet<String>> {
        (**self).sources()
    }
}

/// A raw nearest-neighbour match as returned by the store.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The stored chunk (text and metadata, no embedding).
    pub document: Document,
    /// Store-defined distance; see [`DistanceMetric`].
    pub distance: f32,
}

/// A nearest-neighbour match with its distance mapped into [0, 1].
#[derive(Debug, Clone)]
pub struct Hit {
    pub document: Document,
    pub distance: f32,
    pub similarity: f32,
}

// -- Distance semantics --

/// What the numbers returned by the store mean.
///
/// This has to be confirmed once per store integration
/// (see [`crate::diagnostics::probe_metric`]); it does not change at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine distance in [0, 2], where 0 means identical.
    #[default]
    CosineDistance,
    /// Already a similarity in [0, 1], where 1 means identical.
    Similarity,
}

impl DistanceMetric {
    /// Convert a raw store value into a similarity in [0, 1].
    pub fn to_similarity(self, raw: f32) -> f32 {
        match self {
            DistanceMetric::CosineDistance => similarity_from_distance(raw),
            DistanceMetric::Similarity if raw.is_nan() => 0.0,
            DistanceMetric::Similarity => raw.clamp(0.0, 1.0),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::CosineDistance => f.write_str("cosine_distance"),
            DistanceMetric::Similarity => f.write_str("similarity"),
        }
    }
}

/// Map a cosine distance in [0, 2] to a similarity in [0, 1].
///
/// # Examples
///
/// ```
/// use docrag::vector_store::similarity_from_distance;
///
/// assert_eq!(similarity_from_distance(0.0), 1.0);
/// assert_eq!(similarity_from_distance(1.0), 0.5);
/// assert_eq!(similarity_from_distance(2.0), 0.0);
/// // Out-of-range values are clamped.
/// assert_eq!(similarity_from_distance(-0.1), 1.0);
/// assert_eq!(similarity_from_distance(2.5), 0.0);
/// ```
pub fn similarity_from_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

// -- Retries --

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op`, retrying transient failures until attempts run out.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        of = attempts,
                        "{what} failed, retrying in {delay:?}: {err}"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// -- Client --

/// Summary of a successful [`VectorStoreClient::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReport {
    /// Sub-batches sent to the store.
    pub batches: usize,
    /// Documents written.
    pub items: usize,
}

pub struct VectorStoreClient<S> {
    store: S,
    metric: DistanceMetric,
    retry: RetryPolicy,
}

impl<S: VectorStore> VectorStoreClient<S> {
    pub fn new(store: S, metric: DistanceMetric, retry: RetryPolicy) -> Self {
        Self {
            store,
            metric,
            retry,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Write `documents`, splitting them into sequential sub-batches that
    /// respect the store's per-call limit.
    ///
    /// # Errors
    ///
    /// Every document must carry an embedding of the same dimension. If a
    /// sub-batch fails after retries, returns [`Error::PartialUpsert`]
    /// naming how many sub-batches were already committed.
    pub fn upsert(&self, documents: &[Document]) -> Result<UpsertReport> {
        check_embeddings(documents)?;

        let limit = self.store.max_batch_size().max(1);
        let total = documents.len().div_ceil(limit);

        for (i, batch) in documents.chunks(limit).enumerate() {
            if let Err(cause) = self.retry.run("upsert", || self.store.upsert(batch))
            {
                return Err(Error::PartialUpsert {
                    committed: i,
                    total,
                    cause: Box::new(cause),
                });
            }
            debug!(batch = i + 1, total, items = batch.len(), "upserted");
        }

        Ok(UpsertReport {
            batches: total,
            items: documents.len(),
        })
    }

    /// Up to `k` nearest neighbours of `vector` with similarities.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Hit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let neighbors = self.retry.run("query", || self.store.query(vector, k))?;
        Ok(neighbors
            .into_iter()
            .take(k)
            .map(|n| Hit {
                similarity: self.metric.to_similarity(n.distance),
                distance: n.distance,
                document: n.document,
            })
            .collect())
    }

    /// Raw neighbours without similarity conversion.
    pub fn query_raw(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.retry.run("query", || self.store.query(vector, k))
    }

    pub fn get(&self, id: &ChunkId) -> Result<Option<Document>> {
        self.retry.run("get", || self.store.get(id))
    }

    pub fn count(&self) -> Result<usize> {
        self.retry.run("count", || self.store.count())
    }

    /// Remove `ids` in sub-batches under the store's per-call limit.
    pub fn delete(&self, ids: &[ChunkId]) -> Result<()> {
        let limit = self.store.max_batch_size().max(1);
        for batch in ids.chunks(limit) {
            self.retry.run("delete", || self.store.delete(batch))?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.retry.run("clear", || self.store.clear())
    }

    pub fn sources(&self) -> Result<BTreeSet<String>> {
        self.retry.run("list sources", || self.store.sources())
    }

    /// Delete chunks of `source` left over from an earlier, longer
    /// version of the file, given that it now has `total_chunks` chunks.
    ///
    /// Chunk ids are derived from source and index, so the leftovers are
    /// exactly the indices from `total_chunks` up to the chunk count
    /// recorded on the stored first chunk. Returns how many were removed.
    pub fn remove_stale_chunks(
        &self,
        source: &str,
        total_chunks: usize,
    ) -> Result<usize> {
        let Some(first) = self.get(&ChunkId::new(source, 0))? else {
            return Ok(0);
        };
        let previous = first.total_chunks().unwrap_or(0);
        if previous <= total_chunks {
            return Ok(0);
        }

        let stale: Vec<ChunkId> = (total_chunks..previous)
            .map(|i| ChunkId::new(source, i))
            .collect();
        self.delete(&stale)?;
        debug!(source, removed = stale.len(), "removed stale chunks");
        Ok(stale.len())
    }
}

fn check_embeddings(documents: &[Document]) -> Result<()> {
    let mut dimension = None;
    for doc in documents {
        let embedding = doc.embedding().ok_or_else(|| Error::MissingEmbedding {
            id: doc.id().to_string(),
        })?;
        match dimension {
            None => dimension = Some(embedding.dimension()),
            Some(expected) if expected != embedding.dimension() => {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// -- Stored metadata --

/// Metadata written next to each chunk.
pub fn chunk_metadata(doc: &Document) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("source".into(), Value::from(doc.source()));
    meta.insert("chunk_index".into(), Value::from(doc.chunk_index()));
    if let Some(total) = doc.total_chunks() {
        meta.insert("total_chunks".into(), Value::from(total));
    }
    if let Some(embedding) = doc.embedding() {
        meta.insert("model".into(), Value::from(embedding.model()));
    }
    meta
}

/// Rebuild a chunk from what the store returned.
///
/// Entries without a `source` fall back to their id so foreign data in a
/// shared collection still shows up somewhere sensible.
pub fn document_from_stored(
    id: &str,
    content: &str,
    metadata: Option<&Map<String, Value>>,
    vector: Option<Vec<f32>>,
) -> Result<Document> {
    let source = metadata
        .and_then(|m| m.get("source"))
        .and_then(Value::as_str)
        .unwrap_or(id);
    let chunk_index = metadata
        .and_then(|m| m.get("chunk_index"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let total_chunks = metadata
        .and_then(|m| m.get("total_chunks"))
        .and_then(Value::as_u64);

    let mut doc =
        Document::with_id(ChunkId::from_raw(id), source, chunk_index, content)?;
    if let Some(total) = total_chunks {
        doc = doc.with_total_chunks(total as usize);
    }
    if let Some(vector) = vector {
        let model = metadata
            .and_then(|m| m.get("model"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let dimension = vector.len();
        doc = doc.with_embedding(Embedding::new(vector, dimension, model)?);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use proptest::prelude::*;

    use super::*;

    /// Records upsert call sizes; fails calls according to a script.
    struct Recording {
        limit: usize,
        calls: Mutex<Vec<usize>>,
        deletes: Mutex<Vec<usize>>,
        failures: Mutex<Vec<Option<Error>>>,
        queries: AtomicUsize,
    }

    impl Recording {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                calls: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                queries: AtomicUsize::new(0),
            }
        }

        /// Queue outcomes for the next calls; `None` means succeed.
        fn script(self, outcomes: Vec<Option<Error>>) -> Self {
            *self.failures.lock().unwrap() = outcomes;
            self
        }

        fn next_outcome(&self) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                return Ok(());
            }
            match failures.remove(0) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    impl VectorStore for Recording {
        fn max_batch_size(&self) -> usize {
            self.limit
        }

        fn upsert(&self, documents: &[Document]) -> Result<()> {
            assert!(documents.len() <= self.limit);
            self.next_outcome()?;
            self.calls.lock().unwrap().push(documents.len());
            Ok(())
        }

        fn query(&self, _vector: &[f32], _k: usize) -> Result<Vec<Neighbor>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.next_outcome()?;
            Ok(vec![
                Neighbor {
                    document: Document::new("a.md", 0, "alpha").unwrap(),
                    distance: 0.0,
                },
                Neighbor {
                    document: Document::new("b.md", 0, "beta").unwrap(),
                    distance: 1.5,
                },
            ])
        }

        fn get(&self, _id: &ChunkId) -> Result<Option<Document>> {
            Ok(None)
        }

        fn count(&self) -> Result<usize> {
            Ok(self.calls.lock().unwrap().iter().sum())
        }

        fn delete(&self, ids: &[ChunkId]) -> Result<()> {
            assert!(ids.len() <= self.limit);
            self.next_outcome()?;
            self.deletes.lock().unwrap().push(ids.len());
            Ok(())
        }

        fn clear(&self) -> Result<()> {
            self.next_outcome()
        }

        fn sources(&self) -> Result<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }
    }

    fn embedded(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                Document::new("doc.md", i, "text")
                    .unwrap()
                    .with_embedding(Embedding::new(vec![1.0, 0.0], 2, "m").unwrap())
            })
            .collect()
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn refused() -> Error {
        Error::Connection {
            service: "vector store",
            message: "connection refused".into(),
        }
    }

    #[test]
    fn splits_upserts_under_the_store_limit() {
        let client = VectorStoreClient::new(
            Recording::new(5000),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        let report = client.upsert(&embedded(12_000)).unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.items, 12_000);
        assert_eq!(*client.store.calls.lock().unwrap(), vec![5000, 5000, 2000]);
    }

    #[test]
    fn empty_upsert_makes_no_calls() {
        let client = VectorStoreClient::new(
            Recording::new(10),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        let report = client.upsert(&[]).unwrap();
        assert_eq!(report.batches, 0);
        assert!(client.store.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn retries_transient_failures() {
        let store = Recording::new(10).script(vec![Some(refused()), None]);
        let client =
            VectorStoreClient::new(store, DistanceMetric::CosineDistance, no_wait());

        client.upsert(&embedded(5)).unwrap();
        assert_eq!(*client.store.calls.lock().unwrap(), vec![5]);
    }

    #[test]
    fn reports_committed_sub_batches_on_fatal_error() {
        let malformed = Error::MalformedResponse {
            service: "vector store",
            message: "bad".into(),
        };
        let store = Recording::new(10).script(vec![None, Some(malformed)]);
        let client =
            VectorStoreClient::new(store, DistanceMetric::CosineDistance, no_wait());

        let err = client.upsert(&embedded(25)).unwrap_err();
        match err {
            Error::PartialUpsert {
                committed, total, ..
            } => {
                assert_eq!(committed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected PartialUpsert, got {other}"),
        }
        assert_eq!(*client.store.calls.lock().unwrap(), vec![10]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let store = Recording::new(10).script(vec![
            Some(refused()),
            Some(refused()),
            Some(refused()),
            None,
        ]);
        let client =
            VectorStoreClient::new(store, DistanceMetric::CosineDistance, no_wait());

        let err = client.query(&[1.0, 0.0], 5).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(client.store.queries.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejects_documents_without_embeddings() {
        let client = VectorStoreClient::new(
            Recording::new(10),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        let docs = vec![Document::new("a.md", 0, "text").unwrap()];
        assert!(matches!(
            client.upsert(&docs),
            Err(Error::MissingEmbedding { .. })
        ));
    }

    #[test]
    fn rejects_mixed_dimensions() {
        let client = VectorStoreClient::new(
            Recording::new(10),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        let mut docs = embedded(2);
        docs.push(
            Document::new("b.md", 0, "text")
                .unwrap()
                .with_embedding(Embedding::new(vec![1.0; 3], 3, "m").unwrap()),
        );
        assert!(matches!(
            client.upsert(&docs),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(client.store.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn deletes_in_sub_batches_with_retries() {
        let store = Recording::new(4).script(vec![Some(refused()), None]);
        let client =
            VectorStoreClient::new(store, DistanceMetric::CosineDistance, no_wait());
        let ids: Vec<ChunkId> = (0..10).map(|i| ChunkId::new("a.md", i)).collect();

        client.delete(&ids).unwrap();
        assert_eq!(*client.store.deletes.lock().unwrap(), vec![4, 4, 2]);
    }

    #[test]
    fn query_converts_distance_to_similarity() {
        let client = VectorStoreClient::new(
            Recording::new(10),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        let hits = client.query(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].similarity, 1.0);
        assert!((hits[1].similarity - 0.25).abs() < 1e-6);
    }

    #[test]
    fn query_truncates_to_k() {
        let client = VectorStoreClient::new(
            Recording::new(10),
            DistanceMetric::CosineDistance,
            no_wait(),
        );
        assert_eq!(client.query(&[1.0, 0.0], 1).unwrap().len(), 1);
        assert!(client.query(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn similarity_metric_only_clamps() {
        let m = DistanceMetric::Similarity;
        assert_eq!(m.to_similarity(0.8), 0.8);
        assert_eq!(m.to_similarity(1.3), 1.0);
        assert_eq!(m.to_similarity(f32::NAN), 0.0);
    }

    #[test]
    fn cosine_distance_landmarks() {
        // identical, orthogonal, opposite
        assert_eq!(similarity_from_distance(0.0), 1.0);
        assert_eq!(similarity_from_distance(1.0), 0.5);
        assert_eq!(similarity_from_distance(2.0), 0.0);
        assert_eq!(similarity_from_distance(f32::NAN), 0.0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn metadata_round_trips_through_document_from_stored() {
        let doc = Document::new("notes/a.md", 4, "hello")
            .unwrap()
            .with_total_chunks(9)
            .with_embedding(Embedding::new(vec![0.5, 0.5], 2, "mini").unwrap());
        let meta = chunk_metadata(&doc);

        let back = document_from_stored(
            doc.id().as_str(),
            doc.content(),
            Some(&meta),
            Some(vec![0.5, 0.5]),
        )
        .unwrap();
        assert_eq!(back.id(), doc.id());
        assert_eq!(back.source(), "notes/a.md");
        assert_eq!(back.chunk_index(), 4);
        assert_eq!(back.total_chunks(), Some(9));
        assert_eq!(back.embedding().map(Embedding::model), Some("mini"));
    }

    #[test]
    fn stored_entries_without_source_use_their_id() {
        let doc = document_from_stored("xyz", "text", None, None).unwrap();
        assert_eq!(doc.source(), "xyz");
        assert_eq!(doc.chunk_index(), 0);
    }

    proptest! {
        #[test]
        fn similarity_stays_in_unit_interval(d in -10.0f32..10.0) {
            let s = similarity_from_distance(d);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn similarity_matches_formula_on_valid_range(d in 0.0f32..=2.0) {
            let s = similarity_from_distance(d);
            prop_assert!((s - (1.0 - d / 2.0)).abs() < 1e-6);
        }

        #[test]
        fn sub_batches_respect_limit_and_cover_input(
            n in 0usize..300,
            limit in 1usize..50,
        ) {
            let client = VectorStoreClient::new(
                Recording::new(limit),
                DistanceMetric::CosineDistance,
                RetryPolicy::none(),
            );
            let report = client.upsert(&embedded(n)).unwrap();
            let calls = client.store.calls.lock().unwrap().clone();
            prop_assert!(calls.iter().all(|&c| c <= limit && c > 0));
            prop_assert_eq!(calls.iter().sum::<usize>(), n);
            prop_assert_eq!(report.batches, calls.len());
        }
    }
}
