pub mod config;
pub mod indexer;
pub mod logging;
pub mod model;
pub mod search;
pub mod storage;

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use serde::Serialize;

pub use config::default_data_dir;
use config::SightConfig;
use indexer::{BadImagePolicy, IndexOptions};
use model::types::SearchResult;
use search::dedup;
use search::embedder_registry::{self, EMBEDDERS, get_embedder};
use search::engine::{SearchContext, SearchEngine};
use search::url::{TargetSite, synthesize_url_for};
use storage::artifacts::{ArtifactPaths, Generation, load_index_pair, save_index_pair};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "sight",
    version,
    about = "Find visually similar catalog products for a photo"
)]
pub struct Cli {
    /// Data directory for indexes, identifier lists, descriptions and models
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to <config dir>/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Encoder to use (see `sight models`)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encode every catalog image into the raw index
    Index {
        /// Catalog root (defaults to the configured catalog_dir)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Skip images that fail to decode instead of aborting
        #[arg(long)]
        skip_unreadable: bool,

        /// Print the build report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove near-duplicates from the raw index
    Dedup {
        /// Cosine similarity at or above which two images are duplicates
        #[arg(long)]
        threshold: Option<f32>,

        /// Print the dedup report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find catalog products similar to one or more query images
    ///
    /// Descriptions are read from <data dir>/descriptions/descriptions-<key>.json
    /// when present.
    Search {
        /// Query image files (JPEG or PNG)
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Number of results per query
        #[arg(short = 'k', long = "top-k")]
        top_k: Option<usize>,

        /// Marketplace for result links
        #[arg(long, value_enum)]
        site: Option<TargetSite>,

        /// Emit one JSON array of results per query
        #[arg(long)]
        json: bool,

        /// Search the raw index instead of the deduplicated one
        #[arg(long)]
        raw: bool,
    },
    /// Print the marketplace search link for a product description
    Url {
        description: String,

        #[arg(long, value_enum)]
        site: Option<TargetSite>,
    },
    /// List available encoders
    Models {
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "sight", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Man => {
            let man = clap_mangen::Man::new(Cli::command());
            man.render(&mut std::io::stdout())?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = SightConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }

    match cli.command {
        Commands::Index {
            catalog,
            skip_unreadable,
            json,
        } => {
            if let Some(catalog) = catalog {
                config.catalog_dir = catalog;
            }
            if skip_unreadable {
                config.on_bad_image = BadImagePolicy::Skip;
            }
            config.validate()?;
            run_index_command(&config, json)
        }
        Commands::Dedup { threshold, json } => {
            if let Some(threshold) = threshold {
                config.dedup_threshold = threshold;
            }
            config.validate()?;
            run_dedup_command(&config, json)
        }
        Commands::Search {
            images,
            top_k,
            site,
            json,
            raw,
        } => {
            if let Some(k) = top_k {
                config.top_k = k;
            }
            if let Some(site) = site {
                config.target_site = site;
            }
            config.validate()?;
            let generation = if raw { Generation::Raw } else { Generation::Dedup };
            run_search_command(&config, images, generation, json).await
        }
        Commands::Url { description, site } => {
            let site = site.unwrap_or(config.target_site);
            println!("{}", synthesize_url_for(&description, site));
            Ok(())
        }
        Commands::Models { json } => run_models_command(&config, json),
        Commands::Completions { .. } | Commands::Man => Ok(()),
    }
}

fn show_progress() -> bool {
    std::io::stderr().is_terminal()
}

fn storage_key_for(config: &SightConfig) -> Result<String> {
    Ok(embedder_registry::resolve(Some(&config.model))?.storage_key())
}

fn run_index_command(config: &SightConfig, json: bool) -> Result<()> {
    let registered = embedder_registry::resolve(Some(&config.model))?;
    let embedder = get_embedder(&config.data_dir, Some(registered.name), show_progress())?;
    let opts = IndexOptions {
        catalog_root: config.catalog_dir.clone(),
        data_dir: config.data_dir.clone(),
        on_bad_image: config.on_bad_image,
        show_progress: show_progress(),
    };
    let report = indexer::run_index(&opts, embedder.as_ref(), &registered.storage_key())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Indexed {} images ({} skipped) with {} in {:.1}s",
            report.indexed,
            report.skipped,
            report.embedder_id,
            report.elapsed.as_secs_f64()
        );
        println!("  index:       {}", report.index_path.display());
        println!("  identifiers: {}", report.identifiers_path.display());
    }
    Ok(())
}

fn run_dedup_command(config: &SightConfig, json: bool) -> Result<()> {
    let key = storage_key_for(config)?;
    let raw = ArtifactPaths::new(&config.data_dir, &key, Generation::Raw);
    if !raw.index.is_file() {
        bail!(
            "raw index {} not found; run `sight index` first",
            raw.index.display()
        );
    }
    let (index, identifiers) = load_index_pair(&raw)?;
    let deduped = dedup::deduplicate(&index, &identifiers, config.dedup_threshold)?;

    let out = ArtifactPaths::new(&config.data_dir, &key, Generation::Dedup);
    save_index_pair(&out, &deduped.index, &deduped.identifiers)?;

    let report = deduped.report(config.dedup_threshold);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Deduplicated {} -> {} images ({} removed, {:.1}% reduction) at threshold {}",
            report.before,
            report.after,
            report.removed,
            report.reduction_pct(),
            report.threshold
        );
        println!("  index: {}", out.index.display());
    }
    Ok(())
}

async fn run_search_command(
    config: &SightConfig,
    images: Vec<PathBuf>,
    generation: Generation,
    json: bool,
) -> Result<()> {
    let registered = embedder_registry::resolve(Some(&config.model))?;
    let paths = ArtifactPaths::new(&config.data_dir, &registered.storage_key(), generation);
    let context = Arc::new(SearchContext::load(&paths)?);
    let embedder = get_embedder(&config.data_dir, Some(registered.name), show_progress())?;
    let engine = Arc::new(SearchEngine::new(context, embedder, config.target_site)?);

    let k = config.top_k;
    let tasks: Vec<_> = images
        .iter()
        .cloned()
        .map(|path| {
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || engine.search_path(&path, k))
        })
        .collect();

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        outcomes.push(task.await.context("search task panicked")?);
    }

    let mut stdout = std::io::stdout().lock();
    let mut failed = 0usize;
    for (path, outcome) in images.iter().zip(outcomes) {
        match outcome {
            Ok(results) => {
                if json {
                    writeln!(stdout, "{}", serde_json::to_string(&results)?)?;
                } else {
                    print_results(&mut stdout, path, &results)?;
                }
            }
            Err(err) => {
                failed += 1;
                tracing::error!(query = %path.display(), error = %format!("{err:#}"), "query failed");
                if json {
                    let line = serde_json::json!({
                        "query": path.display().to_string(),
                        "error": format!("{err:#}"),
                    });
                    writeln!(stdout, "{line}")?;
                }
            }
        }
    }
    stdout.flush()?;

    if failed > 0 {
        bail!("{failed} of {} queries failed", images.len());
    }
    Ok(())
}

fn print_results(out: &mut impl Write, query: &Path, results: &[SearchResult]) -> Result<()> {
    writeln!(out, "{}", query.display())?;
    for (rank, result) in results.iter().enumerate() {
        writeln!(out, "  {:>2}. {:.4}  {}", rank + 1, result.score, result.identifier)?;
        writeln!(out, "      {}", result.description)?;
        writeln!(out, "      {}", result.marketplace_url)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ModelListing {
    name: &'static str,
    id: &'static str,
    dimension: usize,
    storage_key: String,
    description: &'static str,
    available: bool,
    cached: bool,
    default: bool,
}

fn run_models_command(config: &SightConfig, json: bool) -> Result<()> {
    let listings: Vec<ModelListing> = EMBEDDERS
        .iter()
        .map(|e| ModelListing {
            name: e.name,
            id: e.id,
            dimension: e.dimension,
            storage_key: e.storage_key(),
            description: e.description,
            available: e.is_compiled_in(),
            cached: e.is_cached(&config.data_dir),
            default: embedder_registry::lookup(&config.model).is_some_and(|c| c.name == e.name),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    for m in &listings {
        let status = match (m.available, m.cached) {
            (false, _) => "not built",
            (true, false) => "download on first use",
            (true, true) => "ready",
        };
        let marker = if m.default { "*" } else { " " };
        println!(
            "{marker} {:<10} {:<18} {:>4}d  {:<22} {status}",
            m.name, m.id, m.dimension, m.storage_key
        );
        println!("    {}", m.description);
    }
    Ok(())
}
