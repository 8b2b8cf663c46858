use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gjd_analysis::{AnalysisConfig, AnalysisOutcome, Analyzer, FeedbackStats, Rules, RunLedger};
use gjd_core::{CorrectionEvent, NormalizedPosting};
use gjd_storage::{FileKeyValueStore, KeyValueStore, MemoryFingerprintStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Parser)]
#[command(name = "gjd-cli")]
#[command(about = "Ghost Job Detector command-line interface")]
struct Cli {
    /// Directory holding scoring.yaml and companies.yaml (overrides GJD_RULES_DIR).
    #[arg(long, global = true)]
    rules_dir: Option<PathBuf>,
    /// Directory for weight and company snapshots (overrides GJD_STATE_DIR).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Resume from and write back snapshots in the state directory.
    #[arg(long, global = true)]
    persist: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze one posting stored as JSON.
    Analyze { file: PathBuf },
    /// Analyze every posting in a JSON-lines file, then print run stats.
    Batch { file: PathBuf },
    /// Classify a submission URL.
    Classify { url: String },
    /// Feed JSON-lines correction events and print the resulting weights.
    Correct { file: PathBuf },
    /// Analyze a JSON-lines file and print only the run stats.
    Stats { file: PathBuf },
}

#[derive(Debug, Serialize)]
struct FailedLine {
    line: usize,
    error: String,
    detail: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    Registry::default()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (analyzer, worker) = build_analyzer(&cli).await?;

    match &cli.command {
        Commands::Analyze { file } => {
            let posting: NormalizedPosting = read_json(file)?;
            let outcome = analyzer
                .analyze(&posting)
                .await
                .with_context(|| format!("analyzing {}", file.display()))?;
            print_json(&outcome)?;
        }
        Commands::Batch { file } => {
            let ledger = run_batch(&analyzer, file, true).await?;
            print_json(&ledger.stats())?;
        }
        Commands::Classify { url } => {
            let classification = analyzer.classify(url)?;
            print_json(&classification)?;
        }
        Commands::Correct { file } => {
            let events: Vec<(usize, CorrectionEvent)> = read_jsonl(file)?;
            let total = events.len();
            let mut rejected = 0usize;
            for (line, event) in events {
                if let Err(err) = analyzer.apply_correction(event) {
                    rejected += 1;
                    warn!(line, error = %err, "correction rejected");
                }
            }
            let version = analyzer.feedback().flush().await?;
            info!(total, rejected, version, "corrections processed");
            print_json(analyzer.weights().snapshot().as_ref())?;
        }
        Commands::Stats { file } => {
            let ledger = run_batch(&analyzer, file, false).await?;
            print_json(&ledger.stats())?;
        }
    }

    if cli.persist {
        analyzer.feedback().flush().await?;
        analyzer.persist_snapshots().await?;
    }
    let stats = shutdown(&analyzer, worker).await?;
    info!(
        applied = stats.applied,
        dropped = stats.dropped,
        published = stats.published,
        "done"
    );
    Ok(())
}

async fn build_analyzer(cli: &Cli) -> Result<(Analyzer, JoinHandle<FeedbackStats>)> {
    let mut config = AnalysisConfig::from_env();
    if let Some(dir) = &cli.rules_dir {
        config.rules_dir = dir.clone();
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    let rules = Rules::from_dir(&config.rules_dir)
        .with_context(|| format!("loading rules from {}", config.rules_dir.display()))?;
    let fingerprints = Arc::new(MemoryFingerprintStore::new());

    if cli.persist {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(&config.state_dir));
        let restored = Analyzer::restore(config, rules, fingerprints, store)
            .await
            .context("restoring snapshots")?;
        Ok(restored)
    } else {
        Ok(Analyzer::new(config, rules, fingerprints, None))
    }
}

async fn run_batch(analyzer: &Analyzer, file: &Path, print_outcomes: bool) -> Result<RunLedger> {
    let postings: Vec<(usize, NormalizedPosting)> = read_jsonl(file)?;
    let ledger = RunLedger::new();
    for (line, posting) in postings {
        match analyzer.analyze(&posting).await {
            Ok(outcome) => {
                ledger.record(&outcome);
                if print_outcomes {
                    print_outcome_line(&outcome)?;
                }
            }
            Err(err) => {
                warn!(line, error = %err, "posting skipped");
                if print_outcomes {
                    println!(
                        "{}",
                        serde_json::to_string(&FailedLine {
                            line,
                            error: err.user_message(),
                            detail: err.to_string(),
                        })?
                    );
                }
            }
        }
    }
    Ok(ledger)
}

async fn shutdown(analyzer: &Analyzer, worker: JoinHandle<FeedbackStats>) -> Result<FeedbackStats> {
    analyzer.feedback().shutdown().await;
    worker.await.context("feedback worker panicked")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Parses non-blank lines, keeping their 1-based line numbers.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<(usize, T)>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map(|value| (idx + 1, value))
                .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))
        })
        .collect()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome_line(outcome: &AnalysisOutcome) -> Result<()> {
    println!("{}", serde_json::to_string(outcome)?);
    Ok(())
}
