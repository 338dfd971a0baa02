use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    chroma::ChromaOptions,
    chunking::{ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    embedding::{
        DEFAULT_BATCH_SIZE,
        DEFAULT_DIMENSION,
        DEFAULT_MODEL,
        DEFAULT_PARALLELISM,
        EmbeddingOptions,
    },
    error::{Error, Result},
    fusion::DEFAULT_HYBRID_WEIGHT,
    indexing::{DEFAULT_COMMIT_BATCH_SIZE, IndexOptions},
    keyword::KeywordScorer,
    search::{DEFAULT_LIMIT, DEFAULT_MIN_SCORE, OutputShape, SearchConfig},
    vector_store::{DEFAULT_MAX_BATCH_SIZE, DistanceMetric, RetryPolicy},
};

pub const CONFIG_ENV: &str = "DOCRAG_CONFIG";
pub const EMBEDDING_URL_ENV: &str = "DOCRAG_EMBEDDING_URL";
pub const STORE_URL_ENV: &str = "DOCRAG_STORE_URL";
pub const COLLECTION_ENV: &str = "DOCRAG_COLLECTION";

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// An OpenAI-compatible `/v1/embeddings` server.
    #[default]
    Http,
    /// The built-in feature-hashing embedder; needs no server.
    Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub url: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub parallelism: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            url: "http://localhost:8080".into(),
            model: DEFAULT_MODEL.into(),
            dimension: DEFAULT_DIMENSION,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    pub url: String,
    pub tenant: String,
    pub database: String,
    pub collection: String,
    pub max_batch_size: usize,
    pub timeout_secs: u64,
    pub metric: DistanceMetric,
    pub retry: RetrySettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let chroma = ChromaOptions::default();
        Self {
            url: chroma.url,
            tenant: chroma.tenant,
            database: chroma.database,
            collection: chroma.collection,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            timeout_secs: chroma.timeout.as_secs(),
            metric: DistanceMetric::default(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub commit_batch_size: usize,
    pub pattern: Option<String>,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            pattern: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSettings {
    pub limit: usize,
    pub min_score: f32,
    pub hybrid_weight: f32,
    pub dedup: bool,
    /// Boost exact phrase and source matches after fusion.
    pub rerank: bool,
    pub output: OutputShape,
    /// Replaces the built-in synonym table when set.
    pub expansions: Option<BTreeMap<String, Vec<String>>>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            min_score: DEFAULT_MIN_SCORE,
            hybrid_weight: DEFAULT_HYBRID_WEIGHT,
            dedup: true,
            rerank: false,
            output: OutputShape::default(),
            expansions: None,
        }
    }
}

/// Everything the binary needs to build its clients, read from
/// `config.toml`.
///
/// # Examples
///
/// ```
/// use docrag::config::Settings;
///
/// let settings = Settings::from_toml(
///     r#"
///     [search]
///     limit = 8
///
///     [store]
///     collection = "handbook"
///     "#,
/// )
/// .unwrap();
/// assert_eq!(settings.search.limit, 8);
/// assert_eq!(settings.store.collection, "handbook");
/// assert_eq!(settings.indexing.chunk_size, 2000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub embedding: EmbeddingSettings,
    pub store: StoreSettings,
    pub indexing: IndexingSettings,
    pub search: SearchSettings,
    /// File these settings were read from, if any.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from, in order of priority:
    /// 1. An explicit path (from --config)
    /// 2. The DOCRAG_CONFIG environment variable
    /// 3. The XDG config file (~/.config/docrag/config.toml), if present
    ///
    /// With no file, built-in defaults are used. Environment overrides
    /// are applied on top and the result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = if let Some(path) = explicit {
            Some(path.to_path_buf())
        } else if let Ok(val) = std::env::var(CONFIG_ENV) {
            Some(PathBuf::from(val))
        } else {
            xdg::BaseDirectories::with_prefix("docrag")
                .find_config_file("config.toml")
        };

        let mut settings = match &path {
            Some(path) => {
                debug!(path = %path.display(), "reading config file");
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!(
                        "cannot read {}: {e}",
                        path.display()
                    ))
                })?;
                let mut settings = Self::from_toml(&text)?;
                settings.path = Some(path.clone());
                settings
            }
            None => Self::default(),
        };

        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text; missing fields take defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply environment-style overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(EMBEDDING_URL_ENV) {
            self.embedding.url = url;
        }
        if let Some(url) = lookup(STORE_URL_ENV) {
            self.store.url = url;
        }
        if let Some(collection) = lookup(COLLECTION_ENV) {
            self.store.collection = collection;
        }
    }

    /// Check every value that has a valid range.
    pub fn validate(&self) -> Result<()> {
        self.search_config()?;
        self.index_options()?;

        let e = &self.embedding;
        if e.dimension == 0 || e.batch_size == 0 || e.parallelism == 0 {
            return Err(Error::Config(
                "embedding dimension, batch_size and parallelism must be positive"
                    .into(),
            ));
        }
        if e.timeout_secs == 0 || self.store.timeout_secs == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.store.max_batch_size == 0 {
            return Err(Error::Config(
                "store max_batch_size must be positive".into(),
            ));
        }
        if self.store.retry.max_attempts == 0 {
            return Err(Error::Config(
                "store retry max_attempts must be at least 1".into(),
            ));
        }
        if self.store.collection.trim().is_empty() {
            return Err(Error::Config("store collection cannot be empty".into()));
        }
        Ok(())
    }

    pub fn search_config(&self) -> Result<SearchConfig> {
        let s = &self.search;
        Ok(SearchConfig::new(s.limit)?
            .with_min_score(s.min_score)?
            .with_hybrid_weight(s.hybrid_weight)?
            .with_dedup(s.dedup)
            .with_rerank(s.rerank)
            .with_output_shape(s.output))
    }

    pub fn index_options(&self) -> Result<IndexOptions> {
        let i = &self.indexing;
        if i.commit_batch_size == 0 {
            return Err(Error::Config(
                "commit_batch_size must be positive".into(),
            ));
        }
        Ok(IndexOptions {
            chunking: ChunkingConfig::new(i.chunk_size, i.chunk_overlap)?,
            commit_batch_size: i.commit_batch_size,
            pattern: i.pattern.clone(),
            rebuild: false,
        })
    }

    pub fn embedding_options(&self) -> EmbeddingOptions {
        EmbeddingOptions {
            dimension: self.embedding.dimension,
            batch_size: self.embedding.batch_size,
            parallelism: self.embedding.parallelism,
        }
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    pub fn chroma_options(&self) -> ChromaOptions {
        let s = &self.store;
        ChromaOptions {
            url: s.url.clone(),
            tenant: s.tenant.clone(),
            database: s.database.clone(),
            collection: s.collection.clone(),
            timeout: Duration::from_secs(s.timeout_secs),
            max_batch_size: s.max_batch_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let r = &self.store.retry;
        RetryPolicy {
            max_attempts: r.max_attempts,
            initial_backoff: Duration::from_millis(r.initial_backoff_ms),
            max_backoff: Duration::from_millis(r.max_backoff_ms),
        }
    }

    pub fn keyword_scorer(&self) -> KeywordScorer {
        match &self.search.expansions {
            Some(table) => KeywordScorer::with_expansions(
                table.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            None => KeywordScorer::new(),
        }
    }
}
