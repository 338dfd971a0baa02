//! Health checks against a populated store: whether its distance
//! semantics match the configuration, and which files it is missing.

use std::path::PathBuf;

use globset::GlobMatcher;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    doc_id::ChunkId,
    error::{Error, Result},
    progress::FailedSource,
    vector_store::{DistanceMetric, VectorStore, VectorStoreClient},
    walker::resolve_inputs,
};

/// How far a self-distance may drift from the expected value.
const SELF_DISTANCE_TOLERANCE: f32 = 0.05;

/// Result of querying the store with one of its own vectors.
#[derive(Debug, Clone, Serialize)]
pub struct MetricProbe {
    pub probe_id: ChunkId,
    /// Raw value the store reported between the probe and itself.
    pub self_distance: f32,
    pub probe_norm: f32,
    /// The stored vector has (almost) no length, so cosine is undefined.
    pub degenerate: bool,
    /// Metric implied by the self-distance; unknown for degenerate probes.
    pub detected: Option<DistanceMetric>,
    pub configured: DistanceMetric,
}

impl MetricProbe {
    /// Whether the store behaves the way the client is configured to read it.
    pub fn matches_configuration(&self) -> bool {
        self.detected == Some(self.configured)
    }
}

/// Probe the store's distance semantics.
///
/// The nearest stored chunk to `seed` is fetched with its embedding and
/// queried back. Identical vectors sit at distance 0 under a distance
/// metric and at 1 under a similarity score.
///
/// Returns `Ok(None)` when the store is empty.
///
/// # Errors
///
/// Fails if the store does not return the probe's embedding, or if the
/// self-distance is close to neither 0 nor 1.
pub fn probe_metric<S: VectorStore>(
    store: &VectorStoreClient<S>,
    seed: &[f32],
) -> Result<Option<MetricProbe>> {
    let Some(nearest) = store.query_raw(seed, 1)?.into_iter().next() else {
        return Ok(None);
    };
    let probe_id = nearest.document.id().clone();

    let stored = store.get(&probe_id)?.ok_or_else(|| Error::NotFound {
        kind: "chunk",
        name: probe_id.to_string(),
    })?;
    let embedding = stored.embedding().ok_or_else(|| Error::MissingEmbedding {
        id: probe_id.to_string(),
    })?;

    let probe_norm = embedding.norm();
    let degenerate = probe_norm <= f32::EPSILON;
    if degenerate {
        warn!(id = %probe_id, "stored vector has zero norm");
    }

    let neighbors = store.query_raw(embedding.vector(), 3)?;
    let self_distance = neighbors
        .iter()
        .find(|n| n.document.id() == &probe_id)
        .or_else(|| neighbors.first())
        .map(|n| n.distance)
        .ok_or_else(|| Error::MalformedResponse {
            service: "vector store",
            message: "probe query returned no neighbours".into(),
        })?;
    debug!(id = %probe_id, self_distance, probe_norm, "metric probe");

    let detected = if degenerate {
        None
    } else if self_distance.abs() <= SELF_DISTANCE_TOLERANCE {
        Some(DistanceMetric::CosineDistance)
    } else if (self_distance - 1.0).abs() <= SELF_DISTANCE_TOLERANCE {
        Some(DistanceMetric::Similarity)
    } else {
        return Err(Error::Config(format!(
            "self-distance {self_distance} of chunk {probe_id} matches no supported metric"
        )));
    };

    Ok(Some(MetricProbe {
        probe_id,
        self_distance,
        probe_norm,
        degenerate,
        detected,
        configured: store.metric(),
    }))
}

// -- Coverage --

/// Files under the given inputs that have no chunk in the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Unindexed {
    /// Source ids (absolute paths) with nothing stored, sorted.
    pub missing: Vec<String>,
    /// Inputs that could not be walked or read.
    pub unresolved: Vec<FailedSource>,
    /// Supported files found under the inputs.
    pub checked: usize,
}

/// Compare the files under `paths` with the sources the store holds.
pub fn find_unindexed<S: VectorStore>(
    store: &VectorStoreClient<S>,
    paths: &[PathBuf],
    pattern: Option<&GlobMatcher>,
) -> Result<Unindexed> {
    let (files, unresolved) = resolve_inputs(paths, pattern);
    let indexed = store.sources()?;

    let mut missing: Vec<String> = files
        .iter()
        .map(|f| f.source())
        .filter(|source| !indexed.contains(source))
        .collect();
    missing.sort();
    debug!(
        checked = files.len(),
        missing = missing.len(),
        stored_sources = indexed.len(),
        "coverage check"
    );

    Ok(Unindexed {
        missing,
        unresolved,
        checked: files.len(),
    })
}
