use std::process::ExitCode;

use clap::Parser;
use docrag::{
    ChunkId,
    IndexStatus,
    IndexingProgress,
    Indexer,
    Searcher,
    chroma::ChromaStore,
    config::{EmbeddingProvider, Settings},
    diagnostics::{find_unindexed, probe_metric},
    embedding::{EmbeddingClient, EmbeddingService, HashEmbedder, HttpEmbedder},
    error::{Error, Result},
    search,
    vector_store::VectorStoreClient,
    walker::compile_pattern,
};
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

type Embedder = EmbeddingClient<Box<dyn EmbeddingService>>;
type Store = VectorStoreClient<ChromaStore>;

/// Text embedded to pick a stored chunk for the metric probe.
const PROBE_TEXT: &str = "docrag distance metric probe";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(cli.verbose, cli.quiet);
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Index(args) => {
            args.apply(&mut settings);
            settings.validate()?;
            cmd_index(&settings, &args.paths, args.rebuild, cli.quiet)
        }
        Command::Search(args) => {
            args.apply(&mut settings);
            settings.validate()?;
            cmd_search(&settings, &args.query)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status(args) => {
            cmd_status(&settings, &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Get(args) => {
            cmd_get(&settings, &args.id, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Completions(_) => Ok(ExitCode::SUCCESS),
    }
}

fn build_embedder(settings: &Settings) -> Result<Embedder> {
    let service: Box<dyn EmbeddingService> = match settings.embedding.provider {
        EmbeddingProvider::Http => Box::new(HttpEmbedder::new(
            &settings.embedding.url,
            settings.embedding.model.clone(),
            settings.embedding_timeout(),
        )?),
        EmbeddingProvider::Hash => {
            Box::new(HashEmbedder::new(settings.embedding.dimension)?)
        }
    };
    EmbeddingClient::new(service, settings.embedding_options())
}

fn connect_store(settings: &Settings) -> Result<Store> {
    let store = ChromaStore::connect(&settings.chroma_options())?;
    Ok(VectorStoreClient::new(
        store,
        settings.store.metric,
        settings.retry_policy(),
    ))
}

fn cmd_index(
    settings: &Settings,
    paths: &[std::path::PathBuf],
    rebuild: bool,
    quiet: bool,
) -> Result<ExitCode> {
    let embedder = build_embedder(settings)?;
    let store = connect_store(settings)?;
    let mut options = settings.index_options()?;
    options.rebuild = rebuild;
    let indexer = Indexer::new(&embedder, &store, options)?;

    let mut bar = (!quiet).then(|| tqdm!(desc = "Indexing", unit = " docs"));
    let progress = indexer.index_with_progress(paths, |p| {
        if let Some(bar) = bar.as_mut() {
            bar.total = p.total;
            let _ = bar.update_to(p.processed + p.failed);
        }
    });
    if bar.is_some() {
        eprintln!();
    }

    print_summary(&progress);
    if progress.status == IndexStatus::Failed {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(progress: &IndexingProgress) {
    println!(
        "Indexed {} of {} document(s), {} chunk(s) in {:.1?} ({:.0} docs/min)",
        progress.processed,
        progress.total,
        progress.chunks_committed,
        progress.elapsed(),
        progress.docs_per_minute(),
    );
    if progress.failed > 0 {
        println!("{} document(s) failed:", progress.failed);
        for failure in &progress.failed_sources {
            println!("  {}: {}", failure.source, failure.reason);
        }
    }
    if progress.chunks_removed > 0 {
        println!(
            "Removed {} stale chunk(s) of shortened documents",
            progress.chunks_removed
        );
    }
    if progress.batch_failures > 0 {
        println!("{} commit batch(es) dropped", progress.batch_failures);
    }
    match progress.status {
        IndexStatus::Failed => println!(
            "Indexing failed: {}",
            progress.error.as_deref().unwrap_or("unknown error")
        ),
        IndexStatus::Cancelled => println!(
            "Indexing cancelled after {} document(s)",
            progress.checkpoint()
        ),
        _ => {}
    }
}

fn cmd_search(settings: &Settings, query: &str) -> Result<()> {
    let embedder = build_embedder(settings)?;
    let store = connect_store(settings)?;
    let config = settings.search_config()?;

    let results = Searcher::new(&embedder, &store)
        .with_keyword_scorer(settings.keyword_scorer())
        .search(query, &config)?;

    print!("{}", search::render(&results, query, config.output_shape())?);
    Ok(())
}

fn cmd_status(settings: &Settings, args: &cli::StatusArgs) -> Result<()> {
    let (verify_metric, json) = (args.verify_metric, args.json);
    let store = connect_store(settings)?;
    let count = store.count()?;

    let unindexed = if args.unindexed.is_empty() {
        None
    } else {
        let matcher = args.pattern.as_deref().map(compile_pattern).transpose()?;
        Some(find_unindexed(&store, &args.unindexed, matcher.as_ref())?)
    };

    let probe = if verify_metric {
        let embedder = build_embedder(settings)?;
        let seed = embedder.embed_query(PROBE_TEXT)?;
        probe_metric(&store, seed.vector())?
    } else {
        None
    };

    if json {
        let value = serde_json::json!({
            "config_file": settings.path,
            "store_url": settings.store.url,
            "collection": settings.store.collection,
            "chunks": count,
            "metric": settings.store.metric,
            "embedding_provider": settings.embedding.provider,
            "embedding_model": settings.embedding.model,
            "dimension": settings.embedding.dimension,
            "metric_probe": probe,
            "unindexed": unindexed,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let config_file = settings
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".into());
    println!("Config: {config_file}");
    println!("Store: {} ({})", settings.store.url, settings.store.collection);
    println!("Chunks: {count}");
    println!("Metric: {}", settings.store.metric);
    println!(
        "Embedding: {} (dimension {})",
        settings.embedding.model, settings.embedding.dimension
    );

    if verify_metric {
        match probe {
            None => println!("Metric probe: store is empty"),
            Some(probe) => {
                println!(
                    "Metric probe: self-distance {:.4} on chunk {}",
                    probe.self_distance,
                    probe.probe_id.short()
                );
                if probe.degenerate {
                    println!("  stored vector has zero norm");
                } else if probe.matches_configuration() {
                    println!("  store agrees with configured metric");
                } else if let Some(detected) = probe.detected {
                    println!(
                        "  store reports {detected}, but {} is configured",
                        probe.configured
                    );
                }
            }
        }
    }

    if let Some(report) = unindexed {
        println!(
            "Unindexed: {} of {} file(s)",
            report.missing.len(),
            report.checked
        );
        for source in &report.missing {
            println!("  {source}");
        }
        for failure in &report.unresolved {
            println!("  cannot check {}: {}", failure.source, failure.reason);
        }
    }
    Ok(())
}

fn cmd_get(settings: &Settings, id: &str, json: bool) -> Result<()> {
    let store = connect_store(settings)?;
    let id = ChunkId::from_raw(id);
    let document = store.get(&id)?.ok_or_else(|| Error::NotFound {
        kind: "chunk",
        name: id.to_string(),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        println!("source: {}", document.source());
        match document.total_chunks() {
            Some(total) => {
                println!("chunk: {} of {total}", document.chunk_index() + 1)
            }
            None => println!("chunk: {}", document.chunk_index() + 1),
        }
        println!();
        println!("{}", document.content());
    }
    Ok(())
}
