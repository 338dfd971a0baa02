//! Ephemeral keyword scoring over a query's candidate set.
//!
//! Nothing here is persisted: every query tokenizes its own candidates,
//! scores term-frequency overlap with the query, and normalizes the
//! scores within that set. Work is bounded by the candidate count, never
//! by corpus size.

use std::collections::{HashMap, HashSet};

use tantivy::tokenizer::{
    Language,
    LowerCaser,
    RemoveLongFilter,
    SimpleTokenizer,
    Stemmer,
    TextAnalyzer,
    TokenStream,
};

use crate::error::{Error, Result};

/// Upper bound on candidates scored per query.
pub const MAX_KEYWORD_CANDIDATES: usize = 1000;

/// Synonym table applied to queries by default.
pub const DEFAULT_EXPANSIONS: &[(&str, &[&str])] = &[
    ("python", &["python", "py", "programming"]),
    ("ml", &["machine learning", "ml", "artificial intelligence"]),
    ("ai", &["artificial intelligence", "ai", "machine learning"]),
    ("api", &["api", "interface", "endpoint"]),
];

/// Anything that can score candidate texts against a query.
///
/// Scores are in [0, 1], one per candidate, in candidate order.
pub trait KeywordScoring: Send + Sync {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>>;
}

/// Term-frequency scorer using an English stemming analyzer.
///
/// # Examples
///
/// ```
/// use docrag::keyword::{KeywordScorer, KeywordScoring};
///
/// let scorer = KeywordScorer::new();
/// let scores = scorer
///     .score("borrow checker", &["the borrow checker rejects this", "cats"])
///     .unwrap();
/// assert_eq!(scores, vec![1.0, 0.0]);
/// ```
#[derive(Clone)]
pub struct KeywordScorer {
    analyzer: TextAnalyzer,
    expansions: HashMap<String, Vec<String>>,
}

impl KeywordScorer {
    /// Scorer with the default synonym table.
    pub fn new() -> Self {
        let expansions = DEFAULT_EXPANSIONS
            .iter()
            .map(|(key, terms)| {
                (
                    key.to_string(),
                    terms.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        Self::with_expansions(expansions)
    }

    /// Scorer with a custom synonym table (may be empty).
    ///
    /// When a key appears as a query token, the analyzed tokens of its
    /// synonyms count as query terms too.
    pub fn with_expansions(expansions: HashMap<String, Vec<String>>) -> Self {
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(Stemmer::new(Language::English))
            .build();
        let expansions = expansions
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            analyzer,
            expansions,
        }
    }

    fn tokens(&self, text: &str) -> Vec<String> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }

    /// Analyzed query terms, including synonym expansions.
    pub fn query_terms(&self, query: &str) -> HashSet<String> {
        let mut terms: HashSet<String> =
            self.tokens(query).into_iter().collect();

        let raw_words: HashSet<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        for (key, synonyms) in &self.expansions {
            if raw_words.contains(key) {
                for synonym in synonyms {
                    terms.extend(self.tokens(synonym));
                }
            }
        }

        terms
    }

    /// Share of a candidate's tokens that are query terms.
    fn raw_score(&self, terms: &HashSet<String>, candidate: &str) -> f32 {
        let tokens = self.tokens(candidate);
        if tokens.is_empty() {
            return 0.0;
        }
        let hits = tokens.iter().filter(|t| terms.contains(*t)).count();
        hits as f32 / tokens.len() as f32
    }
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordScoring for KeywordScorer {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        if candidates.len() > MAX_KEYWORD_CANDIDATES {
            return Err(Error::Keyword(format!(
                "{} candidates exceed the limit of {MAX_KEYWORD_CANDIDATES}",
                candidates.len()
            )));
        }

        let terms = self.query_terms(query);
        if terms.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }

        let raw: Vec<f32> = candidates
            .iter()
            .map(|c| self.raw_score(&terms, c))
            .collect();
        normalize(&raw)
    }
}

/// Scale scores into [0, 1] relative to the best candidate.
///
/// This is min-max normalization with the floor pinned at zero: a
/// candidate without any overlap always scores 0, and if nothing overlaps
/// every score is 0.
fn normalize(raw: &[f32]) -> Result<Vec<f32>> {
    if let Some(bad) = raw.iter().find(|s| !s.is_finite() || **s < 0.0) {
        return Err(Error::Keyword(format!("invalid raw score {bad}")));
    }

    let max = raw.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Ok(vec![0.0; raw.len()]);
    }
    Ok(raw.iter().map(|s| (s / max).clamp(0.0, 1.0)).collect())
}
