use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    doc_id::ChunkId,
    document::Document,
    error::{Error, Result},
    vector_store::{DEFAULT_MAX_BATCH_SIZE, Neighbor, VectorStore},
};

/// An in-process [`VectorStore`] using exact cosine distance.
///
/// Distances follow [`DistanceMetric::CosineDistance`]
/// (`1 - cos(a, b)`, in [0, 2]). Useful for tests and for embedding the
/// pipeline in programs that do not need persistence.
///
/// [`DistanceMetric::CosineDistance`]:
///     crate::vector_store::DistanceMetric::CosineDistance
#[derive(Debug)]
pub struct MemoryStore {
    max_batch_size: usize,
    chunks: RwLock<BTreeMap<ChunkId, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    /// A store that rejects upserts larger than `max_batch_size`, like a
    /// remote service would.
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            chunks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Ids of every stored chunk, sorted.
    pub fn ids(&self) -> Result<Vec<ChunkId>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<ChunkId, Document>>> {
        self.chunks.read().map_err(|_| poisoned())
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<ChunkId, Document>>> {
        self.chunks.write().map_err(|_| poisoned())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Poisoned {
        what: "memory store",
    }
}

/// Cosine distance; zero vectors are treated as orthogonal to everything.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 1.0;
    }
    1.0 - dot / (na * nb)
}

impl VectorStore for MemoryStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn upsert(&self, documents: &[Document]) -> Result<()> {
        if documents.len() > self.max_batch_size {
            return Err(Error::Upstream {
                service: "memory store",
                status: 413,
                message: format!(
                    "batch of {} exceeds limit of {}",
                    documents.len(),
                    self.max_batch_size
                ),
            });
        }

        let mut chunks = self.write()?;
        for doc in documents {
            chunks.insert(doc.id().clone(), doc.clone());
        }
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let chunks = self.read()?;
        let mut scored: Vec<(f32, &Document)> = chunks
            .values()
            .filter_map(|doc| {
                let embedding = doc.embedding()?;
                Some((cosine_distance(vector, embedding.vector()), doc))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.0.total_cmp(&b.0).then_with(|| a.1.id().cmp(b.1.id()))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, doc)| Neighbor {
                document: doc.clone().without_embedding(),
                distance,
            })
            .collect())
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Document>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn delete(&self, ids: &[ChunkId]) -> Result<()> {
        let mut chunks = self.write()?;
        for id in ids {
            chunks.remove(id);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    fn sources(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read()?
            .values()
            .map(|doc| doc.source().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        document::Embedding,
        vector_store::{DistanceMetric, RetryPolicy, VectorStoreClient},
    };

    fn chunk(source: &str, vector: Vec<f32>) -> Document {
        let dim = vector.len();
        Document::new(source, 0, format!("text of {source}"))
            .unwrap()
            .with_embedding(Embedding::new(vector, dim, "m").unwrap())
    }

    #[test]
    fn cosine_distance_landmarks() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn query_returns_nearest_first() {
        let store = MemoryStore::new();
        store
            .upsert(&[
                chunk("far.md", vec![-1.0, 0.0]),
                chunk("near.md", vec![1.0, 0.1]),
                chunk("mid.md", vec![0.0, 1.0]),
            ])
            .unwrap();

        let hits = store.query(&[1.0, 0.0], 2).unwrap();
        let sources: Vec<_> = hits.iter().map(|h| h.document.source()).collect();
        assert_eq!(sources, vec!["near.md", "mid.md"]);
        assert!(hits[0].document.embedding().is_none());
    }

    #[test]
    fn upsert_overwrites_by_id() {
        let store = MemoryStore::new();
        store.upsert(&[chunk("a.md", vec![1.0, 0.0])]).unwrap();
        store.upsert(&[chunk("a.md", vec![0.0, 1.0])]).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let id = ChunkId::new("a.md", 0);
        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.embedding().unwrap().vector(), &[0.0, 1.0]);
    }

    #[test]
    fn rejects_oversized_batches() {
        let store = MemoryStore::with_max_batch_size(1);
        let err = store
            .upsert(&[chunk("a.md", vec![1.0]), chunk("b.md", vec![1.0])])
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 413, .. }));
        assert_eq!(store.count().unwrap(), 0);
    }

    fn file_chunks(source: &str, total: usize) -> Vec<Document> {
        (0..total)
            .map(|i| {
                Document::new(source, i, format!("part {i}"))
                    .unwrap()
                    .with_total_chunks(total)
                    .with_embedding(
                        Embedding::new(vec![1.0, i as f32], 2, "m").unwrap(),
                    )
            })
            .collect()
    }

    #[test]
    fn delete_clear_and_sources() {
        let store = MemoryStore::new();
        store.upsert(&file_chunks("a.md", 3)).unwrap();
        store.upsert(&file_chunks("b.md", 1)).unwrap();
        assert_eq!(
            store.sources().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["a.md", "b.md"]
        );

        store
            .delete(&[ChunkId::new("a.md", 2), ChunkId::new("missing.md", 0)])
            .unwrap();
        assert_eq!(store.count().unwrap(), 3);

        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.sources().unwrap().is_empty());
    }

    #[test]
    fn shrinking_file_leaves_no_stale_chunks() {
        let client = VectorStoreClient::new(
            MemoryStore::new(),
            DistanceMetric::CosineDistance,
            RetryPolicy::none(),
        );
        client.upsert(&file_chunks("a.md", 15)).unwrap();
        client.upsert(&file_chunks("other.md", 2)).unwrap();

        assert_eq!(client.remove_stale_chunks("a.md", 1).unwrap(), 14);
        client.upsert(&file_chunks("a.md", 1)).unwrap();

        assert_eq!(client.count().unwrap(), 3);
        assert!(client.get(&ChunkId::new("a.md", 1)).unwrap().is_none());
        // Growing or unknown files have nothing to remove.
        assert_eq!(client.remove_stale_chunks("a.md", 4).unwrap(), 0);
        assert_eq!(client.remove_stale_chunks("new.md", 1).unwrap(), 0);
    }

    #[test]
    fn poisoned_lock_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let clone = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = clone.chunks.write().unwrap();
            panic!("writer died");
        })
        .join();

        let err = store.count().unwrap_err();
        assert!(matches!(err, Error::Poisoned { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn empty_store_returns_nothing() {
        let store = MemoryStore::new();
        assert!(store.query(&[1.0], 5).unwrap().is_empty());
        assert!(store.get(&ChunkId::new("x", 0)).unwrap().is_none());
    }
}
