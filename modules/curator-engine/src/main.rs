use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use curator_common::{load_config, structural_outline, OracleProvider, RecordStatus, Secrets};
use curator_engine::artifacts::ArtifactDir;
use curator_engine::embedder::VoyageEmbedder;
use curator_engine::index::MemoryIndex;
use curator_engine::oracle::{ClaudeOracle, StubOracle};
use curator_engine::store::FileStore;
use curator_engine::traits::{DecisionOracle, RecordStore};
use curator_engine::{Curator, RunOptions};

/// Records embedded per provider call when warming the index.
const INDEX_BATCH: usize = 128;

#[derive(Parser)]
#[command(name = "curator", about = "Knowledge-base curation engine")]
#[command(version)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) a curation pass over the store
    Run {
        /// Path to config TOML file
        #[arg(long, default_value = "./curator.toml")]
        config: PathBuf,
        /// Record store directory
        #[arg(long, default_value = "./data")]
        store: PathBuf,
        /// Run output directory (state, logs, report)
        #[arg(long, default_value = "./curator-out")]
        out: PathBuf,
        /// Decide everything, change nothing
        #[arg(long)]
        dry_run: bool,
        /// Ignore saved run state
        #[arg(long)]
        fresh: bool,
        /// Discard stale run state without asking
        #[arg(long)]
        yes: bool,
        /// Review communities above the size cap too
        #[arg(long)]
        include_oversized: bool,
        #[arg(long)]
        max_rounds: Option<u32>,
    },
    /// Show saved run state
    Status {
        #[arg(long, default_value = "./curator-out")]
        out: PathBuf,
        /// Show the dry-run state instead
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a config file and print the effective values
    CheckConfig {
        #[arg(long, default_value = "./curator.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("curator=info".parse()?);
    if cli.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run {
            config,
            store,
            out,
            dry_run,
            fresh,
            yes,
            include_oversized,
            max_rounds,
        } => {
            let options = RunOptions {
                fresh,
                assume_yes: yes,
            };
            run(&config, &store, &out, dry_run, include_oversized, max_rounds, options).await
        }
        Command::Status { out, dry_run } => status(&out, dry_run).await,
        Command::CheckConfig { config } => {
            let config = load_config(&config)
                .with_context(|| format!("Invalid config {}", config.display()))?;
            println!("{}", toml::to_string_pretty(&config)?);
            info!("Config OK");
            Ok(())
        }
    }
}

async fn run(
    config_path: &Path,
    store_dir: &Path,
    out: &Path,
    dry_run: bool,
    include_oversized: bool,
    max_rounds: Option<u32>,
    options: RunOptions,
) -> Result<()> {
    info!("Curator starting...");

    let mut config = load_config(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    config.run.dry_run |= dry_run;
    config.rounds.include_oversized |= include_oversized;
    if let Some(n) = max_rounds {
        config.rounds.max_rounds = n;
    }
    config.validate()?;

    let secrets = Secrets::from_env();
    secrets.require_for(&config)?;

    let store = Arc::new(FileStore::open(store_dir).await?);

    let voyage_key = secrets.voyage_api_key.clone().unwrap_or_default();
    let embedder = Arc::new(VoyageEmbedder::new(&voyage_key, &config.index)?);
    let mut index = MemoryIndex::new(embedder.clone());
    if config.index.rerank {
        index = index.with_reranker(embedder);
    }
    warm_index(&index, store.as_ref()).await?;

    let oracle: Arc<dyn DecisionOracle> = match config.oracle.provider {
        OracleProvider::Claude => {
            let key = secrets.anthropic_api_key.clone().unwrap_or_default();
            Arc::new(ClaudeOracle::new(&key, &config.oracle))
        }
        OracleProvider::Stub => {
            warn!("Using the stub oracle: every community goes to manual review");
            Arc::new(StubOracle)
        }
    };
    info!(oracle = oracle.name(), dry_run = config.run.dry_run, "Oracle ready");

    let curator = Curator::new(store, Arc::new(index), oracle, config, out).with_options(options);

    let stop = curator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current round");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let report = curator.run().await?;
    info!("Curator complete. {report}");
    Ok(())
}

/// Embed every live record up front in batches.
async fn warm_index(index: &MemoryIndex, store: &dyn RecordStore) -> Result<()> {
    let items: Vec<(String, String)> = store
        .all()
        .await?
        .into_iter()
        .filter(|r| r.status != RecordStatus::Superseded)
        .map(|r| {
            let text = r
                .outline()
                .map(str::to_string)
                .unwrap_or_else(|| structural_outline(&r));
            (r.id, text)
        })
        .collect();
    let total = items.len();
    for chunk in items.chunks(INDEX_BATCH) {
        index.upsert_batch(chunk.to_vec()).await?;
    }
    info!(records = total, "Similarity index warmed");
    Ok(())
}

async fn status(out: &Path, dry_run: bool) -> Result<()> {
    let artifacts = ArtifactDir::for_run(out, dry_run);
    let Some(state) = artifacts.load_state().await? else {
        println!("No run state in {}", artifacts.root().display());
        return Ok(());
    };
    println!("run:      {}", state.run_id);
    println!("phase:    {}", state.phase);
    println!("round:    {} of {}", state.round, state.max_rounds);
    if let Some(batch) = &state.batch {
        println!(
            "batch:    {} of {} communities applied",
            batch.offset,
            batch.communities.len()
        );
    }
    match state.outcome {
        Some(outcome) => println!("outcome:  {outcome}"),
        None => println!("outcome:  in progress"),
    }
    println!("updated:  {}", state.updated_at.to_rfc3339());
    println!("summary:  {}", state.report);
    Ok(())
}
