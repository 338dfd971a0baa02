use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docrag::{OutputShape, config::Settings};

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Hybrid semantic and keyword retrieval over your documents"
)]
pub struct Cli {
    /// Config file (overrides DOCRAG_CONFIG and the XDG location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk, embed and store documents
    Index(IndexArgs),
    /// Search indexed documents
    Search(SearchArgs),
    /// Show store and configuration status
    Status(StatusArgs),
    /// Print one stored chunk by id
    Get(GetArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Files or directories to index
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Only index files whose relative path matches this glob
    #[arg(long)]
    pub pattern: Option<String>,

    /// Chunk size in characters
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long)]
    pub overlap: Option<usize>,

    /// Chunks embedded and stored per commit
    #[arg(long)]
    pub commit_batch_size: Option<usize>,

    /// Remove everything from the collection before indexing
    #[arg(long)]
    pub rebuild: bool,
}

impl IndexArgs {
    /// Layer these flags over the loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        let indexing = &mut settings.indexing;
        if let Some(pattern) = &self.pattern {
            indexing.pattern = Some(pattern.clone());
        }
        if let Some(size) = self.chunk_size {
            indexing.chunk_size = size;
        }
        if let Some(overlap) = self.overlap {
            indexing.chunk_overlap = overlap;
        }
        if let Some(batch) = self.commit_batch_size {
            indexing.commit_batch_size = batch;
        }
    }
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Minimum combined score
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Share of the score given to semantic similarity (0 to 1)
    #[arg(long)]
    pub weight: Option<f32>,

    /// Allow several results from the same document
    #[arg(long)]
    pub no_dedup: bool,

    /// Boost results containing the exact query
    #[arg(long)]
    pub rerank: bool,

    /// Output format: paths, brief, full or json
    #[arg(short, long)]
    pub output: Option<OutputShape>,
}

impl SearchArgs {
    /// Layer these flags over the loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        let search = &mut settings.search;
        if let Some(limit) = self.limit {
            search.limit = limit;
        }
        if let Some(min_score) = self.min_score {
            search.min_score = min_score;
        }
        if let Some(weight) = self.weight {
            search.hybrid_weight = weight;
        }
        if self.no_dedup {
            search.dedup = false;
        }
        if self.rerank {
            search.rerank = true;
        }
        if let Some(output) = self.output {
            search.output = output;
        }
    }
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Check that the configured distance metric matches the store
    #[arg(long)]
    pub verify_metric: bool,

    /// List files under these paths that have nothing stored
    #[arg(long, num_args = 1.., value_name = "PATH")]
    pub unindexed: Vec<PathBuf>,

    /// Only check files whose relative path matches this glob
    #[arg(long, requires = "unindexed")]
    pub pattern: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Get --

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Chunk id as shown in search results
    pub id: String,

    /// Output as JSON with metadata
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}
