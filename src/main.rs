//! Cartographer CLI - drives the snapshot store, call graph and semantic index

use anyhow::Context;
use cartographer::chunk::load_chunks;
use cartographer::config::{self, Config, ProviderKind};
use cartographer::embedding::{self, EmbeddingIndex, RemoteProvider};
use cartographer::graph::{Direction, TraceNode};
use cartographer::source::{SnapshotStore, TreeSitterParser};
use cartographer::{CallGraph, ChangeWatcher, storage};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "cartographer")]
#[command(version = "0.1.0")]
#[command(about = "Incremental code intelligence index - snapshots, call graphs and semantic search")]
#[command(long_about = r#"
Cartographer keeps an up-to-date model of a source tree:
  • Fingerprinted file snapshots with lazily built syntax trees
  • Debounced change watching
  • Call graph tracing and path finding over extracted chunks
  • Semantic search with cached embeddings

Example usage:
  cartographer scan --warm
  cartographer trace --chunks chunks.json --symbol Parser.parse --depth 3
  cartographer index --chunks chunks.json
  cartographer search --query "retry with backoff"
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Source root (overrides the config file)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Scan the source tree and report what changed
    Scan {
        /// Build every syntax tree up front
        #[arg(long)]
        warm: bool,
    },

    /// Keep the snapshot current until Enter is pressed
    Watch,

    /// Trace calls from (or to) a symbol
    Trace {
        /// Chunk list produced by the extractor
        #[arg(long)]
        chunks: PathBuf,

        /// Symbol to start from
        #[arg(short, long)]
        symbol: String,

        /// Maximum traversal depth
        #[arg(short, long, default_value = "3")]
        depth: usize,

        /// Follow callers instead of callees
        #[arg(short, long)]
        backward: bool,

        /// Print JSON instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// Find call paths between two symbols
    Paths {
        /// Chunk list produced by the extractor
        #[arg(long)]
        chunks: PathBuf,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// Stop after this many paths
        #[arg(long, default_value = "10")]
        max_paths: usize,

        /// Longest path, in calls
        #[arg(long, default_value = "5")]
        max_depth: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Embed chunks and save the semantic index
    Index {
        /// Chunk list produced by the extractor
        #[arg(long)]
        chunks: PathBuf,
    },

    /// Semantic search over a saved index
    Search {
        /// Search query
        #[arg(short, long)]
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    let mut config = config::load_config(Some(&config_path))?.unwrap_or_default();
    if let Some(root) = cli.root {
        config.root = root;
    }

    match cli.command {
        Commands::Init { force } => {
            config::write_config(&config_path, &config, force)?;
            println!("Wrote {}", config_path.display());
        }

        Commands::Scan { warm } => {
            let store = open_store(&config)?;
            if warm {
                let built = store.warm_cache()?;
                println!("Built {} syntax trees", built);
            }
            println!("{}", store.stats());
        }

        Commands::Watch => {
            let store = Arc::new(open_store(&config)?);
            println!("{}", store.stats());

            let watcher = ChangeWatcher::start(store.clone(), config.debounce())?;
            println!("Watching {} (press Enter to stop)", store.root().display());

            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            watcher.stop();
            println!("{}", store.stats());
        }

        Commands::Trace {
            chunks,
            symbol,
            depth,
            backward,
            json,
        } => {
            let graph = load_graph(&chunks)?;
            let direction = if backward {
                Direction::Backward
            } else {
                Direction::Forward
            };
            let result = graph.trace(&symbol, depth, direction);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} ({} nodes, depth {})",
                    result.resolved, result.node_count, result.max_depth
                );
                for child in &result.tree.children {
                    print_tree(child, 1);
                }
            }
        }

        Commands::Paths {
            chunks,
            from,
            to,
            max_paths,
            max_depth,
            json,
        } => {
            let graph = load_graph(&chunks)?;
            let result = graph.find_paths(&from, &to, max_paths, max_depth);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.paths.is_empty() {
                println!("No path from {} to {}", result.source, result.target);
            } else {
                for path in &result.paths {
                    println!("[{}] {}", path.length, path.symbols.join(" -> "));
                }
            }
        }

        Commands::Index { chunks } => {
            let chunks = load_chunks(&chunks)
                .with_context(|| format!("reading chunks from {}", chunks.display()))?;
            let store = open_store(&config)?;
            let mut index = open_index(&config)?;

            let index_path = config.index_path();
            if index_path.exists() {
                index.load(&index_path)?;
            }

            let report = index.index(&chunks, &store)?;
            index.save(&index_path)?;
            println!("{} -> {}", report, index_path.display());
        }

        Commands::Search { query, limit } => {
            let mut index = open_index(&config)?;
            let index_path = config.index_path();
            index
                .load(&index_path)
                .with_context(|| format!("loading index from {}", index_path.display()))?;

            let hits = index.search(&query, limit)?;
            if hits.is_empty() {
                println!("No results");
            }
            for hit in hits {
                println!(
                    "{:.3}  {}  {}:{}-{}",
                    hit.score, hit.chunk.symbol, hit.chunk.file, hit.chunk.start_line, hit.chunk.end_line
                );
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SnapshotStore> {
    let store = SnapshotStore::new(config, Arc::new(TreeSitterParser::new()));
    let units = store.scan()?;
    tracing::debug!("Snapshot of {} holds {} units", store.root().display(), units);
    Ok(store)
}

fn open_index(config: &Config) -> anyhow::Result<EmbeddingIndex> {
    let cache = storage::cache_from_config(&config.cache)?;
    if config.embedding.provider != ProviderKind::Remote {
        let provider = embedding::provider_from_config(&config.embedding)?;
        return Ok(EmbeddingIndex::new(provider, cache));
    }

    let provider = open_remote(config)?.with_capabilities();
    let project = config
        .root
        .canonicalize()
        .ok()
        .and_then(|root| root.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "cartographer".to_string());
    let reporter = provider.job_reporter(project);
    Ok(EmbeddingIndex::new(Arc::new(provider), cache).with_progress(Arc::new(reporter)))
}

/// Catch a misconfigured dimensionality before any vectors are computed
fn open_remote(config: &Config) -> anyhow::Result<RemoteProvider> {
    let endpoint = config
        .embedding
        .endpoint
        .as_deref()
        .context("embedding.endpoint is required for the remote provider")?;
    let provider = RemoteProvider::from_config(endpoint, &config.embedding)?;

    match provider.health() {
        Ok(health) => {
            if let Some(dimensions) = health.dimensions {
                anyhow::ensure!(
                    dimensions == config.embedding.dimensions,
                    "service at {} produces {} dimensions, config says {}",
                    endpoint,
                    dimensions,
                    config.embedding.dimensions
                );
            }
            tracing::info!(
                "Embedding service {} is {} ({})",
                endpoint,
                health.status,
                health.model.as_deref().unwrap_or("unknown model")
            );
        }
        Err(e) => tracing::warn!("Health check failed for {}: {}", endpoint, e),
    }
    Ok(provider)
}

fn load_graph(path: &Path) -> anyhow::Result<CallGraph> {
    let chunks =
        load_chunks(path).with_context(|| format!("reading chunks from {}", path.display()))?;
    let graph = CallGraph::build(&chunks);
    tracing::info!("{}", graph.stats());
    Ok(graph)
}

fn print_tree(node: &TraceNode, depth: usize) {
    let location = match (&node.file, node.line) {
        (Some(file), Some(line)) => format!("  {}:{}", file, line),
        (Some(file), None) => format!("  {}", file),
        _ => String::new(),
    };
    println!("{}{}{}", "  ".repeat(depth), node.symbol, location);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}
