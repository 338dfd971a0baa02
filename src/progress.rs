use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Lifecycle of an indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Stopped at a commit-batch boundary on request.
    Cancelled,
}

impl IndexStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            IndexStatus::Completed | IndexStatus::Failed | IndexStatus::Cancelled
        )
    }
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexStatus::Pending => "pending",
            IndexStatus::InProgress => "in progress",
            IndexStatus::Completed => "completed",
            IndexStatus::Failed => "failed",
            IndexStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A source document that could not be indexed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub source: String,
    pub reason: String,
}

/// Progress of one indexing run.
///
/// The orchestrator owns the live value; callers only ever see clones
/// taken after a commit batch or at the end of the run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub status: IndexStatus,
    /// Source documents discovered for this run.
    pub total: usize,
    /// Sources whose chunks were all committed.
    pub processed: usize,
    /// Sources that could not be (fully) indexed.
    pub failed: usize,
    pub failed_sources: Vec<FailedSource>,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    /// Leftover chunks of files that shrank since they were last indexed.
    pub chunks_removed: usize,
    pub batches_committed: usize,
    /// Commit batches dropped because the embedding service was down.
    pub batch_failures: usize,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    /// Fatal error that ended the run, if any.
    pub error: Option<String>,
}

impl IndexingProgress {
    pub fn new() -> Self {
        Self {
            status: IndexStatus::Pending,
            total: 0,
            processed: 0,
            failed: 0,
            failed_sources: Vec::new(),
            chunks_committed: 0,
            chunks_failed: 0,
            chunks_removed: 0,
            batches_committed: 0,
            batch_failures: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = IndexStatus::InProgress;
        self.started_at = Some(SystemTime::now());
    }

    pub(crate) fn finish(&mut self, status: IndexStatus) {
        self.status = status;
        self.finished_at = Some(SystemTime::now());
    }

    pub(crate) fn mark_processed(&mut self) {
        self.processed += 1;
    }

    pub(crate) fn mark_failed(
        &mut self,
        source: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.failed += 1;
        self.failed_sources.push(FailedSource {
            source: source.into(),
            reason: reason.into(),
        });
    }

    /// Sources fully committed so far; a rerun can resume after these.
    pub fn checkpoint(&self) -> usize {
        self.processed
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Wall time since the run started, up to its end if it has ended.
    pub fn elapsed(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.finished_at.unwrap_or_else(SystemTime::now);
        end.duration_since(started).unwrap_or_default()
    }

    /// Sources settled (processed or failed) per minute.
    pub fn docs_per_minute(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.processed + self.failed) as f64 * 60.0 / secs
    }

    /// Settled share of the discovered sources, in percent.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return if self.is_finished() { 100.0 } else { 0.0 };
        }
        (self.processed + self.failed) as f64 * 100.0 / self.total as f64
    }
}

impl Default for IndexingProgress {
    fn default() -> Self {
        Self::new()
    }
}
