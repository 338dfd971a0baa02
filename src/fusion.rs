//! Weighted fusion of semantic and keyword scores.

use std::cmp::Ordering;

use serde::Serialize;

use crate::{
    document::Document,
    error::{Error, Result},
};

/// Default share of the combined score given to semantic similarity.
pub const DEFAULT_HYBRID_WEIGHT: f32 = 0.95;

/// Rerank multiplier when the whole query appears in the chunk text.
pub const PHRASE_BOOST: f32 = 1.2;

/// Rerank multiplier when the whole query appears in the source path.
pub const SOURCE_BOOST: f32 = 1.1;

/// Fraction of the combined score attributed to semantic similarity.
///
/// Range-checked on construction, so a misconfigured weight is rejected
/// up front instead of being silently clamped at query time. `1.0` is pure
/// semantic ranking and `0.0` is pure keyword ranking.
///
/// # Examples
///
/// ```
/// use docrag::fusion::HybridWeight;
///
/// assert!(HybridWeight::new(0.7).is_ok());
/// assert!(HybridWeight::new(1.5).is_err());
/// assert!(HybridWeight::new(f32::NAN).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HybridWeight(f32);

impl HybridWeight {
    pub const SEMANTIC_ONLY: HybridWeight = HybridWeight(1.0);
    pub const KEYWORD_ONLY: HybridWeight = HybridWeight(0.0);

    pub fn new(weight: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(Error::Config(format!(
                "hybrid weight must be within [0, 1], got {weight}"
            )));
        }
        Ok(Self(weight))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for HybridWeight {
    fn default() -> Self {
        Self(DEFAULT_HYBRID_WEIGHT)
    }
}

/// A retrieved chunk with both raw signals.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub document: Document,
    pub raw_similarity: f32,
    pub keyword_score: f32,
}

/// A candidate with its combined score.
#[derive(Debug, Clone)]
pub struct Fused {
    pub document: Document,
    pub raw_similarity: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
}

/// `weight * similarity + (1 - weight) * keyword`, kept inside [0, 1].
pub fn combine(similarity: f32, keyword: f32, weight: HybridWeight) -> f32 {
    let w = weight.get();
    let combined = w * similarity.clamp(0.0, 1.0)
        + (1.0 - w) * keyword.clamp(0.0, 1.0);
    combined.clamp(0.0, 1.0)
}

/// Score every candidate and sort by combined score, best first.
///
/// Ties are broken by ascending document id so the order is fully
/// deterministic.
pub fn fuse(candidates: Vec<Candidate>, weight: HybridWeight) -> Vec<Fused> {
    let mut fused: Vec<Fused> = candidates
        .into_iter()
        .map(|c| Fused {
            combined_score: combine(c.raw_similarity, c.keyword_score, weight),
            document: c.document,
            raw_similarity: c.raw_similarity,
            keyword_score: c.keyword_score,
        })
        .collect();

    fused.sort_by(compare_fused);
    fused
}

/// Boost exact query matches and re-sort.
///
/// The combined score is multiplied by [`PHRASE_BOOST`] when the query
/// occurs verbatim (ignoring case) in the chunk text and by
/// [`SOURCE_BOOST`] when it occurs in the source path, then capped at 1.
/// Both raw signals are left as they were.
pub fn rerank(mut fused: Vec<Fused>, query: &str) -> Vec<Fused> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return fused;
    }

    for entry in &mut fused {
        let mut boost = 1.0;
        if entry.document.content().to_lowercase().contains(&needle) {
            boost *= PHRASE_BOOST;
        }
        if entry.document.source().to_lowercase().contains(&needle) {
            boost *= SOURCE_BOOST;
        }
        entry.combined_score = (entry.combined_score * boost).min(1.0);
    }

    fused.sort_by(compare_fused);
    fused
}

fn compare_fused(a: &Fused, b: &Fused) -> Ordering {
    b.combined_score
        .total_cmp(&a.combined_score)
        .then_with(|| a.document.id().cmp(b.document.id()))
}
