//! Batched, failure-isolating ingestion into the vector store.
//!
//! Files are read one window at a time and their chunks collected into a
//! commit buffer. Each full buffer is embedded and upserted before the
//! next one is filled, so memory stays bounded by one buffer plus one
//! read window no matter how large the corpus is.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use globset::GlobMatcher;
use tracing::{debug, info, warn};

use crate::{
    chunking::ChunkingConfig,
    document::Document,
    embedding::{EmbeddingClient, EmbeddingService},
    error::{Error, Result},
    ingestion::{READ_WINDOW, load_sources},
    progress::{IndexStatus, IndexingProgress},
    vector_store::{VectorStore, VectorStoreClient},
    walker::{compile_pattern, resolve_inputs},
};

/// Chunks embedded and upserted together.
pub const DEFAULT_COMMIT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub chunking: ChunkingConfig,
    pub commit_batch_size: usize,
    /// Glob over paths relative to each input directory.
    pub pattern: Option<String>,
    /// Empty the whole collection before indexing.
    pub rebuild: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            pattern: None,
            rebuild: false,
        }
    }
}

/// Shared switch that asks a running index to stop.
///
/// The indexer looks at it after every commit, so a cancelled run never
/// leaves a half-written batch behind.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives chunking, embedding and upserting for a set of input paths.
pub struct Indexer<'a, E, S> {
    embedder: &'a EmbeddingClient<E>,
    store: &'a VectorStoreClient<S>,
    options: IndexOptions,
    matcher: Option<GlobMatcher>,
    cancel: CancelFlag,
}

impl<'a, E: EmbeddingService, S: VectorStore> Indexer<'a, E, S> {
    pub fn new(
        embedder: &'a EmbeddingClient<E>,
        store: &'a VectorStoreClient<S>,
        options: IndexOptions,
    ) -> Result<Self> {
        if options.commit_batch_size == 0 {
            return Err(Error::Config(
                "commit batch size must be positive".into(),
            ));
        }
        let matcher =
            options.pattern.as_deref().map(compile_pattern).transpose()?;

        Ok(Self {
            embedder,
            store,
            options,
            matcher,
            cancel: CancelFlag::new(),
        })
    }

    /// Stop this indexer when `flag` is cancelled.
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn index(&self, paths: &[PathBuf]) -> IndexingProgress {
        self.index_with_progress(paths, |_| {})
    }

    /// Index `paths`, handing a snapshot to `on_progress` after every
    /// commit and once more when the run ends.
    ///
    /// Never fails as a whole: document problems are recorded in the
    /// returned summary, and a store failure ends the run as
    /// [`IndexStatus::Failed`] with the error attached.
    ///
    /// Re-indexing a file overwrites its chunks and removes the ones a
    /// shorter version no longer produces.
    pub fn index_with_progress(
        &self,
        paths: &[PathBuf],
        mut on_progress: impl FnMut(&IndexingProgress),
    ) -> IndexingProgress {
        let mut run = Run::new();
        run.progress.start();

        if self.options.rebuild {
            if let Err(err) = self.store.clear() {
                warn!(error = %err, "cannot clear the collection, stopping");
                run.progress.error = Some(err.to_string());
                return run.finish(IndexStatus::Failed, &mut on_progress);
            }
            info!("collection cleared for rebuild");
        }

        let (files, unresolved) = resolve_inputs(paths, self.matcher.as_ref());
        run.progress.total = files.len() + unresolved.len();
        info!(sources = run.progress.total, "indexing started");

        for failure in unresolved {
            warn!(source = %failure.source, reason = %failure.reason, "skipping input");
            run.progress.mark_failed(failure.source, failure.reason);
        }

        for window in files.chunks(READ_WINDOW) {
            for loaded in load_sources(window, &self.options.chunking) {
                let chunks = match loaded.chunks {
                    Ok(chunks) => chunks,
                    Err(err) => {
                        warn!(source = %loaded.source, error = %err, "skipping document");
                        run.progress.mark_failed(loaded.source, err.to_string());
                        continue;
                    }
                };

                if !self.options.rebuild {
                    let stale =
                        self.store.remove_stale_chunks(&loaded.source, chunks.len());
                    match stale {
                        Ok(removed) => run.progress.chunks_removed += removed,
                        Err(err) => {
                            warn!(error = %err, "vector store unavailable, stopping");
                            run.progress.error = Some(err.to_string());
                            return run.finish(IndexStatus::Failed, &mut on_progress);
                        }
                    }
                }

                run.pending.insert(
                    loaded.source,
                    Pending {
                        remaining: chunks.len(),
                        failure: None,
                    },
                );

                for chunk in chunks {
                    run.buffer.push(chunk);
                    if run.buffer.len() >= self.options.commit_batch_size
                        && let Some(status) = self.commit(&mut run, &mut on_progress)
                    {
                        return run.finish(status, &mut on_progress);
                    }
                }
            }
        }

        if !run.buffer.is_empty()
            && let Some(status) = self.commit(&mut run, &mut on_progress)
        {
            return run.finish(status, &mut on_progress);
        }

        let status = if run.progress.total > 0 && run.progress.processed == 0 {
            run.progress.error = Some("no document could be indexed".into());
            IndexStatus::Failed
        } else {
            IndexStatus::Completed
        };
        run.finish(status, &mut on_progress)
    }

    /// Embed and upsert the buffer. Returns a terminal status when the
    /// run has to stop.
    fn commit(
        &self,
        run: &mut Run,
        on_progress: &mut impl FnMut(&IndexingProgress),
    ) -> Option<IndexStatus> {
        let batch: Vec<Document> = std::mem::take(&mut run.buffer);
        let texts: Vec<String> =
            batch.iter().map(|d| d.content().to_string()).collect();
        let results = self.embedder.embed_batch(&texts);

        if results.iter().all(|r| r.is_err()) {
            let reason = results
                .iter()
                .find_map(|r| r.as_ref().err())
                .map(|e| format!("embedding batch aborted: {e}"))
                .unwrap_or_else(|| "embedding batch aborted".into());
            warn!(chunks = batch.len(), %reason, "dropping commit batch");
            run.progress.batch_failures += 1;
            run.progress.chunks_failed += batch.len();
            for doc in &batch {
                run.settle(doc.source(), Some(&reason));
            }
            on_progress(&run.progress);
            return self.cancelled();
        }

        let mut embedded = Vec::with_capacity(batch.len());
        for (doc, result) in batch.into_iter().zip(results) {
            match result {
                Ok(embedding) => embedded.push(doc.with_embedding(embedding)),
                Err(err) => {
                    let reason = format!(
                        "chunk {} failed to embed: {err}",
                        doc.chunk_index()
                    );
                    warn!(source = doc.source(), %reason, "chunk skipped");
                    run.progress.chunks_failed += 1;
                    run.settle(doc.source(), Some(&reason));
                }
            }
        }

        match self.store.upsert(&embedded) {
            Ok(report) => {
                run.progress.chunks_committed += report.items;
                run.progress.batches_committed += 1;
                debug!(
                    chunks = report.items,
                    store_calls = report.batches,
                    "committed batch"
                );
                for doc in &embedded {
                    run.settle(doc.source(), None);
                }
            }
            Err(err) => {
                // Sub-batches before the failing one did land.
                if let Error::PartialUpsert { committed, .. } = &err {
                    let limit = self.store.store().max_batch_size().max(1);
                    let landed = (committed * limit).min(embedded.len());
                    run.progress.chunks_committed += landed;
                    for doc in &embedded[..landed] {
                        run.settle(doc.source(), None);
                    }
                }
                warn!(error = %err, "vector store rejected batch, stopping");
                run.progress.error = Some(err.to_string());
                return Some(IndexStatus::Failed);
            }
        }

        on_progress(&run.progress);
        self.cancelled()
    }

    fn cancelled(&self) -> Option<IndexStatus> {
        if self.cancel.is_cancelled() {
            info!("indexing cancelled");
            Some(IndexStatus::Cancelled)
        } else {
            None
        }
    }
}

/// Chunks of one source still waiting to be committed.
struct Pending {
    remaining: usize,
    failure: Option<String>,
}

struct Run {
    progress: IndexingProgress,
    buffer: Vec<Document>,
    pending: HashMap<String, Pending>,
}

impl Run {
    fn new() -> Self {
        Self {
            progress: IndexingProgress::new(),
            buffer: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Account for one chunk of `source` leaving the pipeline. The
    /// source is counted once its last chunk settles.
    fn settle(&mut self, source: &str, failure: Option<&str>) {
        let Some(entry) = self.pending.get_mut(source) else {
            return;
        };
        if let Some(reason) = failure
            && entry.failure.is_none()
        {
            entry.failure = Some(reason.to_string());
        }
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining > 0 {
            return;
        }

        if let Some(entry) = self.pending.remove(source) {
            match entry.failure {
                Some(reason) => self.progress.mark_failed(source, reason),
                None => self.progress.mark_processed(),
            }
        }
    }

    fn finish(
        mut self,
        status: IndexStatus,
        on_progress: &mut impl FnMut(&IndexingProgress),
    ) -> IndexingProgress {
        self.progress.finish(status);
        info!(
            status = %status,
            processed = self.progress.processed,
            failed = self.progress.failed,
            chunks = self.progress.chunks_committed,
            elapsed = ?self.progress.elapsed(),
            "indexing finished"
        );
        on_progress(&self.progress);
        self.progress
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        embedding::{EmbeddingOptions, HashEmbedder},
        memory_store::MemoryStore,
        vector_store::{DistanceMetric, RetryPolicy},
    };

    const DIM: usize = 16;

    fn embedder() -> EmbeddingClient<HashEmbedder> {
        let options = EmbeddingOptions {
            dimension: DIM,
            ..Default::default()
        };
        EmbeddingClient::new(HashEmbedder::new(DIM).unwrap(), options).unwrap()
    }

    fn store() -> VectorStoreClient<MemoryStore> {
        VectorStoreClient::new(
            MemoryStore::new(),
            DistanceMetric::CosineDistance,
            RetryPolicy::none(),
        )
    }

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    /// Fails every call whose input contains a marker text.
    struct Poisoned {
        inner: HashEmbedder,
    }

    impl EmbeddingService for Poisoned {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("POISON")) {
                return Err(Error::Embedding("model rejected input".into()));
            }
            self.inner.embed(texts)
        }
    }

    /// Refuses every call as if the service were down.
    struct Offline;

    impl EmbeddingService for Offline {
        fn model_id(&self) -> &str {
            "offline"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::Connection {
                service: "embedding service",
                message: "connection refused".into(),
            })
        }
    }

    #[test]
    fn rejects_bad_options() {
        let (e, s) = (embedder(), store());
        let zero = IndexOptions {
            commit_batch_size: 0,
            ..Default::default()
        };
        assert!(Indexer::new(&e, &s, zero).is_err());

        let bad_glob = IndexOptions {
            pattern: Some("[".into()),
            ..Default::default()
        };
        assert!(Indexer::new(&e, &s, bad_glob).is_err());
    }

    #[test]
    fn indexes_every_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.md", "alpha document about rust");
        write(tmp.path(), "b.txt", &"beta words ".repeat(60));

        let (e, s) = (embedder(), store());
        let options = IndexOptions {
            chunking: ChunkingConfig::new(200, 20).unwrap(),
            commit_batch_size: 2,
            ..Default::default()
        };
        let indexer = Indexer::new(&e, &s, options).unwrap();
        let progress = indexer.index(&[tmp.path().to_path_buf()]);

        assert_eq!(progress.status, IndexStatus::Completed);
        assert_eq!(progress.total, 2);
        assert_eq!(progress.processed, 2);
        assert_eq!(progress.failed, 0);
        assert_eq!(progress.chunks_committed, s.count().unwrap());
        assert!(progress.batches_committed >= 2);
    }

    #[test]
    fn document_spanning_batches_counts_once() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "long.md", &"spread across buffers ".repeat(100));

        let (e, s) = (embedder(), store());
        let options = IndexOptions {
            chunking: ChunkingConfig::new(100, 10).unwrap(),
            commit_batch_size: 3,
            ..Default::default()
        };
        let mut snapshots = Vec::new();
        let progress = Indexer::new(&e, &s, options)
            .unwrap()
            .index_with_progress(&[tmp.path().to_path_buf()], |p| {
                snapshots.push(p.processed)
            });

        assert_eq!(progress.processed, 1);
        assert!(snapshots.len() > 2);
        // Only the final commit completes the document.
        assert!(snapshots[..snapshots.len() - 2].iter().all(|p| *p == 0));
    }

    #[test]
    fn one_bad_chunk_fails_only_its_document() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "good.md", "perfectly fine");
        write(tmp.path(), "bad.md", "contains POISON text");

        let service = Poisoned {
            inner: HashEmbedder::new(DIM).unwrap(),
        };
        let options = EmbeddingOptions {
            dimension: DIM,
            ..Default::default()
        };
        let e = EmbeddingClient::new(service, options).unwrap();
        let s = store();
        let progress = Indexer::new(&e, &s, IndexOptions::default())
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);

        assert_eq!(progress.status, IndexStatus::Completed);
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.failed, 1);
        assert!(progress.failed_sources[0].source.ends_with("bad.md"));
        assert_eq!(progress.chunks_failed, 1);
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn embedding_outage_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.md", "alpha");
        write(tmp.path(), "b.md", "beta");

        let options = EmbeddingOptions {
            dimension: DIM,
            ..Default::default()
        };
        let e = EmbeddingClient::new(Offline, options).unwrap();
        let s = store();
        let progress = Indexer::new(&e, &s, IndexOptions::default())
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);

        assert_eq!(progress.status, IndexStatus::Failed);
        assert_eq!(progress.batch_failures, 1);
        assert_eq!(progress.failed, 2);
        assert_eq!(progress.chunks_committed, 0);
        assert_eq!(s.count().unwrap(), 0);
    }

    #[test]
    fn cancel_stops_after_the_current_commit() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..10 {
            write(tmp.path(), &format!("doc{i}.md"), &format!("document {i}"));
        }

        let (e, s) = (embedder(), store());
        let flag = CancelFlag::new();
        let options = IndexOptions {
            commit_batch_size: 2,
            ..Default::default()
        };
        let indexer = Indexer::new(&e, &s, options)
            .unwrap()
            .with_cancel_flag(flag.clone());

        let progress =
            indexer.index_with_progress(&[tmp.path().to_path_buf()], |_| {
                flag.cancel()
            });

        assert_eq!(progress.status, IndexStatus::Cancelled);
        assert_eq!(progress.batches_committed, 1);
        assert_eq!(progress.processed, 2);
        assert_eq!(s.count().unwrap(), 2);
    }

    #[test]
    fn empty_input_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let (e, s) = (embedder(), store());
        let progress = Indexer::new(&e, &s, IndexOptions::default())
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);
        assert_eq!(progress.status, IndexStatus::Completed);
        assert_eq!(progress.total, 0);
        assert_eq!(progress.percent_complete(), 100.0);
    }

    #[test]
    fn pattern_limits_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "keep.md", "kept");
        write(tmp.path(), "skip.txt", "skipped");

        let (e, s) = (embedder(), store());
        let options = IndexOptions {
            pattern: Some("*.md".into()),
            ..Default::default()
        };
        let progress = Indexer::new(&e, &s, options)
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);
        assert_eq!(progress.total, 1);
        assert_eq!(progress.processed, 1);
    }

    /// Accepts two chunks per call and rejects every call after the first.
    struct ReadOnlyAfterFirst {
        inner: MemoryStore,
        writes: std::sync::atomic::AtomicUsize,
    }

    impl VectorStore for ReadOnlyAfterFirst {
        fn max_batch_size(&self) -> usize {
            2
        }

        fn upsert(&self, documents: &[Document]) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::Upstream {
                    service: "vector store",
                    status: 403,
                    message: "collection is read-only".into(),
                });
            }
            self.inner.upsert(documents)
        }

        fn query(
            &self,
            vector: &[f32],
            k: usize,
        ) -> Result<Vec<crate::vector_store::Neighbor>> {
            self.inner.query(vector, k)
        }

        fn get(&self, id: &crate::doc_id::ChunkId) -> Result<Option<Document>> {
            self.inner.get(id)
        }

        fn count(&self) -> Result<usize> {
            self.inner.count()
        }

        fn delete(&self, ids: &[crate::doc_id::ChunkId]) -> Result<()> {
            self.inner.delete(ids)
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }

        fn sources(&self) -> Result<std::collections::BTreeSet<String>> {
            self.inner.sources()
        }
    }

    #[test]
    fn partial_upsert_settles_what_landed() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a.md", "b.md", "c.md"] {
            write(tmp.path(), name, &format!("contents of {name}"));
        }

        let e = embedder();
        let s = VectorStoreClient::new(
            ReadOnlyAfterFirst {
                inner: MemoryStore::new(),
                writes: Default::default(),
            },
            DistanceMetric::CosineDistance,
            RetryPolicy::none(),
        );
        let progress = Indexer::new(&e, &s, IndexOptions::default())
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);

        assert_eq!(progress.status, IndexStatus::Failed);
        assert_eq!(progress.chunks_committed, 2);
        assert_eq!(progress.processed, 2);
        assert_eq!(s.count().unwrap(), 2);
        assert!(progress.error.unwrap().contains("read-only"));
    }

    #[test]
    fn reindexing_a_shrunken_file_removes_its_tail() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "notes.md", &"grows and shrinks ".repeat(400));
        write(tmp.path(), "other.md", "unrelated");

        let (e, s) = (embedder(), store());
        let indexer = Indexer::new(&e, &s, IndexOptions::default()).unwrap();
        let first = indexer.index(&[tmp.path().to_path_buf()]);
        assert!(first.chunks_committed > 2);

        write(tmp.path(), "notes.md", "short now");
        let second = indexer.index(&[tmp.path().to_path_buf()]);

        assert_eq!(second.status, IndexStatus::Completed);
        assert_eq!(second.chunks_removed, first.chunks_committed - 2);
        assert_eq!(s.count().unwrap(), 2);
    }

    #[test]
    fn rebuild_empties_the_collection_first() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "kept.md", "still here");
        let gone = tmp.path().join("gone.md");
        write(tmp.path(), "gone.md", "deleted later");

        let (e, s) = (embedder(), store());
        Indexer::new(&e, &s, IndexOptions::default())
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);
        assert_eq!(s.count().unwrap(), 2);

        std::fs::remove_file(gone).unwrap();
        let options = IndexOptions {
            rebuild: true,
            ..Default::default()
        };
        let progress = Indexer::new(&e, &s, options)
            .unwrap()
            .index(&[tmp.path().to_path_buf()]);

        assert_eq!(progress.status, IndexStatus::Completed);
        assert_eq!(progress.processed, 1);
        assert_eq!(s.count().unwrap(), 1);
    }
}
