use std::{
    collections::HashSet,
    fmt::Write as _,
    str::FromStr,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    dedup::deduplicate,
    document::Document,
    embedding::{EmbeddingClient, EmbeddingService},
    error::{Error, Result},
    fusion::{Candidate, HybridWeight, fuse, rerank},
    keyword::{KeywordScorer, KeywordScoring},
    vector_store::{VectorStore, VectorStoreClient},
};

pub const DEFAULT_LIMIT: usize = 5;
pub const MAX_LIMIT: usize = 100;
pub const DEFAULT_MIN_SCORE: f32 = 0.1;

/// Queries slower than this are logged as warnings.
pub const LATENCY_BUDGET: Duration = Duration::from_secs(2);

/// Characters of chunk text shown per result in brief output.
const SNIPPET_CHARS: usize = 160;

/// How search results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// One source path per line.
    Paths,
    /// Ranked list with scores and a short snippet.
    #[default]
    Brief,
    /// Ranked list with every chunk's full text.
    Full,
    Json,
}

impl FromStr for OutputShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "paths" => Ok(OutputShape::Paths),
            "brief" => Ok(OutputShape::Brief),
            "full" => Ok(OutputShape::Full),
            "json" => Ok(OutputShape::Json),
            other => Err(Error::Config(format!(
                "unknown output shape {other:?} (expected paths, brief, full or json)"
            ))),
        }
    }
}

impl std::fmt::Display for OutputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputShape::Paths => "paths",
            OutputShape::Brief => "brief",
            OutputShape::Full => "full",
            OutputShape::Json => "json",
        };
        f.write_str(s)
    }
}

/// Validated parameters for one query.
///
/// # Examples
///
/// ```
/// use docrag::SearchConfig;
///
/// let config = SearchConfig::new(10)
///     .unwrap()
///     .with_min_score(0.2)
///     .unwrap()
///     .with_dedup(false);
/// assert_eq!(config.limit(), 10);
///
/// assert!(SearchConfig::new(0).is_err());
/// assert!(SearchConfig::new(101).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    limit: usize,
    min_score: f32,
    dedup_enabled: bool,
    rerank_enabled: bool,
    hybrid_weight: HybridWeight,
    output_shape: OutputShape,
}

impl SearchConfig {
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(Error::Config(format!(
                "result limit must be between 1 and {MAX_LIMIT}, got {limit}"
            )));
        }
        Ok(Self {
            limit,
            min_score: DEFAULT_MIN_SCORE,
            dedup_enabled: true,
            rerank_enabled: false,
            hybrid_weight: HybridWeight::default(),
            output_shape: OutputShape::default(),
        })
    }

    pub fn with_min_score(self, min_score: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&min_score) {
            return Err(Error::Config(format!(
                "minimum score must be within [0, 1], got {min_score}"
            )));
        }
        Ok(Self { min_score, ..self })
    }

    pub fn with_hybrid_weight(self, weight: f32) -> Result<Self> {
        Ok(Self {
            hybrid_weight: HybridWeight::new(weight)?,
            ..self
        })
    }

    pub fn with_dedup(self, dedup_enabled: bool) -> Self {
        Self {
            dedup_enabled,
            ..self
        }
    }

    /// Boost exact phrase and source matches after fusion.
    pub fn with_rerank(self, rerank_enabled: bool) -> Self {
        Self {
            rerank_enabled,
            ..self
        }
    }

    pub fn with_output_shape(self, output_shape: OutputShape) -> Self {
        Self {
            output_shape,
            ..self
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    pub fn dedup_enabled(&self) -> bool {
        self.dedup_enabled
    }

    pub fn rerank_enabled(&self) -> bool {
        self.rerank_enabled
    }

    pub fn hybrid_weight(&self) -> HybridWeight {
        self.hybrid_weight
    }

    pub fn output_shape(&self) -> OutputShape {
        self.output_shape
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            min_score: DEFAULT_MIN_SCORE,
            dedup_enabled: true,
            rerank_enabled: false,
            hybrid_weight: HybridWeight::default(),
            output_shape: OutputShape::default(),
        }
    }
}

/// One ranked chunk returned by [`Searcher::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document: Document,
    pub raw_similarity: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
    /// Backfilled after every distinct source was already represented.
    pub is_deduplicated_fill: bool,
    /// Nothing cleared the minimum score; these are the best available.
    pub low_confidence: bool,
}

impl SearchResult {
    pub fn source(&self) -> &str {
        self.document.source()
    }
}

/// Hybrid semantic and keyword search over a vector store.
pub struct Searcher<'a, E, S> {
    embedder: &'a EmbeddingClient<E>,
    store: &'a VectorStoreClient<S>,
    keyword: Box<dyn KeywordScoring + 'a>,
}

impl<'a, E: EmbeddingService, S: VectorStore> Searcher<'a, E, S> {
    /// Searcher using the default [`KeywordScorer`].
    pub fn new(
        embedder: &'a EmbeddingClient<E>,
        store: &'a VectorStoreClient<S>,
    ) -> Self {
        Self {
            embedder,
            store,
            keyword: Box::new(KeywordScorer::new()),
        }
    }

    pub fn with_keyword_scorer(
        self,
        scorer: impl KeywordScoring + 'a,
    ) -> Self {
        Self {
            keyword: Box::new(scorer),
            ..self
        }
    }

    /// Run the full retrieval pipeline for `query`.
    ///
    /// 1. Embed the query
    /// 2. Fetch `2 * limit` nearest chunks from the store
    /// 3. Keyword-score those candidates
    /// 4. Fuse both scores and sort, then rerank (when enabled)
    /// 5. Keep candidates at or above the minimum score; when none
    ///    qualify, keep them all and flag the results low-confidence
    /// 6. Spread what is kept across sources (when enabled)
    /// 7. Truncate to the limit and rank
    ///
    /// An empty list means nothing matched. Failures of the embedding
    /// service or the store are returned as errors; a keyword scoring
    /// failure only degrades the query to semantic ranking.
    pub fn search(
        &self,
        query: &str,
        config: &SearchConfig,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        let started = Instant::now();

        let embedding = self.embedder.embed_query(query)?;
        let embed_time = started.elapsed();

        let k = config.limit() * 2;
        let hits = self.store.query(embedding.vector(), k)?;
        let retrieve_time = started.elapsed() - embed_time;
        if hits.is_empty() {
            debug!(?embed_time, ?retrieve_time, "no candidates");
            return Ok(Vec::new());
        }

        let texts: Vec<&str> = hits.iter().map(|h| h.document.content()).collect();
        let (keyword_scores, weight) = match self.keyword_scores(query, &texts) {
            Ok(scores) => (scores, config.hybrid_weight()),
            Err(err) => {
                warn!(error = %err, "keyword scoring failed, ranking by similarity only");
                (vec![0.0; hits.len()], HybridWeight::SEMANTIC_ONLY)
            }
        };

        let candidates = hits
            .into_iter()
            .zip(keyword_scores)
            .map(|(hit, keyword_score)| Candidate {
                document: hit.document,
                raw_similarity: hit.similarity,
                keyword_score,
            })
            .collect();
        let mut fused = fuse(candidates, weight);
        if config.rerank_enabled() {
            fused = rerank(fused, query);
        }

        let low_confidence =
            !fused.iter().any(|f| f.combined_score >= config.min_score());
        if !low_confidence {
            fused.retain(|f| f.combined_score >= config.min_score());
        }
        let kept = deduplicate(fused, config.limit(), config.dedup_enabled());

        let results: Vec<SearchResult> = kept
            .into_iter()
            .take(config.limit())
            .enumerate()
            .map(|(i, k)| SearchResult {
                document: k.entry.document,
                raw_similarity: k.entry.raw_similarity,
                keyword_score: k.entry.keyword_score,
                combined_score: k.entry.combined_score,
                rank: i + 1,
                is_deduplicated_fill: k.is_fill,
                low_confidence,
            })
            .collect();

        let total = started.elapsed();
        debug!(
            ?embed_time,
            ?retrieve_time,
            rank_time = ?(total - embed_time - retrieve_time),
            results = results.len(),
            low_confidence,
            "search finished"
        );
        if total > LATENCY_BUDGET {
            warn!(elapsed = ?total, budget = ?LATENCY_BUDGET, "slow query");
        }

        Ok(results)
    }

    fn keyword_scores(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        let scores = self.keyword.score(query, texts)?;
        if scores.len() != texts.len() {
            return Err(Error::Keyword(format!(
                "expected {} scores, got {}",
                texts.len(),
                scores.len()
            )));
        }
        Ok(scores)
    }
}

// -- Output --

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    result_count: usize,
    low_confidence: bool,
    results: &'a [SearchResult],
}

/// Format results for printing.
pub fn render(
    results: &[SearchResult],
    query: &str,
    shape: OutputShape,
) -> Result<String> {
    match shape {
        OutputShape::Json => {
            let output = JsonOutput {
                query,
                result_count: results.len(),
                low_confidence: results.iter().any(|r| r.low_confidence),
                results,
            };
            Ok(serde_json::to_string_pretty(&output)?)
        }
        OutputShape::Paths => {
            let mut seen = HashSet::new();
            let mut out = String::new();
            for r in results {
                if seen.insert(r.source()) {
                    let _ = writeln!(out, "{}", r.source());
                }
            }
            Ok(out)
        }
        OutputShape::Brief | OutputShape::Full => {
            Ok(render_listing(results, shape == OutputShape::Full))
        }
    }
}

fn render_listing(results: &[SearchResult], full: bool) -> String {
    let mut out = String::new();
    if results.is_empty() {
        out.push_str("No results found.\n");
        return out;
    }
    if results.iter().any(|r| r.low_confidence) {
        out.push_str("Low confidence: no result reached the minimum score.\n\n");
    }

    for r in results {
        let fill = if r.is_deduplicated_fill { " (fill)" } else { "" };
        let _ = writeln!(
            out,
            "{:>3}. [{:.3}] {} #{}{fill}",
            r.rank,
            r.combined_score,
            r.source(),
            r.document.chunk_index(),
        );
        let _ = writeln!(
            out,
            "     semantic {:.3}  keyword {:.3}  id {}",
            r.raw_similarity,
            r.keyword_score,
            r.document.id().short(),
        );
        if full {
            for line in r.document.content().lines() {
                let _ = writeln!(out, "     {line}");
            }
        } else {
            let _ = writeln!(out, "     {}", snippet(r.document.content()));
        }
    }
    let _ = write!(out, "\n{} result(s)\n", results.len());
    out
}

/// First characters of `text` on one line.
fn snippet(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{cut}...")
}
