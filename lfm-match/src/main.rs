//! lfm-match - Lost & Found Match CLI
//!
//! `analyze` runs one match request against a JSONL catalog and prints the
//! `AnalysisResult` as JSON. `feedback` records whether a match was right,
//! both for the branches that produced it and for the matched object.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, Stream};
use lfm_match::branches::{ContextBranch, EmbeddingBranch, HistoryBranch, ObjectHistory};
use lfm_match::storage::{ImageStore, LocalImageStore};
use lfm_match::{
    BranchScorer, CandidateDescriptor, MatchConfig, MatchEvent, MatchPipeline, QueryDescriptor,
    QueryImage, ReliabilityTable,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments for lfm-match
#[derive(Parser, Debug)]
#[command(name = "lfm-match")]
#[command(about = "Lost & found visual match engine")]
#[command(version)]
struct Args {
    /// Config file (overrides LFM_CONFIG and the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Match a photograph against a catalog
    Analyze {
        /// Query photograph
        #[arg(long)]
        image: PathBuf,

        /// Query descriptor JSON (embeddings, timestamp, location)
        #[arg(long)]
        query: PathBuf,

        /// Catalog, one candidate descriptor JSON object per line
        #[arg(long)]
        catalog: PathBuf,

        /// Print pipeline events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Record match feedback for branches and/or the matched object
    #[command(group(clap::ArgGroup::new("target").required(true).multiple(true).args(["branches", "object_id"])))]
    Feedback {
        /// Comma-separated branch names
        #[arg(long, value_delimiter = ',')]
        branches: Vec<String>,

        /// Catalog object the match was made against
        #[arg(long)]
        object_id: Option<String>,

        /// The match was confirmed
        #[arg(long, conflicts_with = "incorrect", required_unless_present = "incorrect")]
        correct: bool,

        /// The match was rejected
        #[arg(long)]
        incorrect: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = MatchConfig::resolve(args.config.as_deref()).context("Failed to load config")?;
    lfm_common::logging::init_tracing(&config.logging).context("Failed to initialize logging")?;

    info!("Starting lfm-match {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Analyze {
            image,
            query,
            catalog,
            events,
        } => analyze(&config, &image, &query, &catalog, events).await,
        Command::Feedback {
            branches,
            object_id,
            correct,
            incorrect: _,
        } => feedback(&config, &branches, object_id.as_deref(), correct),
    }
}

async fn analyze(
    config: &MatchConfig,
    image: &Path,
    query: &Path,
    catalog: &Path,
    print_events: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let descriptor: QueryDescriptor = serde_json::from_str(
        &tokio::fs::read_to_string(query)
            .await
            .with_context(|| format!("Failed to read query {}", query.display()))?,
    )
    .with_context(|| format!("Failed to parse query {}", query.display()))?;

    let reliability = ReliabilityTable::load(&config.storage.reliability_path)
        .context("Failed to load reliability table")?;
    let policy = reliability
        .effective_policy(&config.fusion_policy()?)
        .context("Failed to build fusion policy")?;

    let history = ObjectHistory::load(&config.storage.history_path)
        .context("Failed to load object history")?;

    let store: Arc<dyn ImageStore> =
        Arc::new(LocalImageStore::new(config.storage.image_root.clone()));
    let mut pipeline = MatchPipeline::new(
        config.to_pipeline_config(policy),
        build_branches(&descriptor, history),
    )
    .context("Failed to configure pipeline")?
    .with_explainer(config.explainer(Arc::clone(&store)))
    .with_store(store);

    let event_printer = if print_events {
        let (tx, rx) = mpsc::channel(100);
        pipeline = pipeline.with_events(tx);
        Some(tokio::spawn(print_events_to_stderr(rx)))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let query = QueryImage {
        source_uri: format!("file://{}", image.display()),
        bytes,
        descriptor,
    };
    let candidates = open_catalog(catalog).await?;

    let result = pipeline
        .run(query, candidates, cancel)
        .await
        .context("Match request failed")?;

    // Closes the event channel so the printer drains and exits
    drop(pipeline);
    if let Some(printer) = event_printer {
        let _ = printer.await;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(())
}

fn feedback(
    config: &MatchConfig,
    branches: &[String],
    object_id: Option<&str>,
    was_correct: bool,
) -> Result<()> {
    if !branches.is_empty() {
        let path = &config.storage.reliability_path;
        let mut table = ReliabilityTable::load(path).context("Failed to load reliability table")?;
        table.record_feedback(branches, was_correct);
        table
            .save(path)
            .with_context(|| format!("Failed to save reliability table {}", path.display()))?;

        for branch in branches {
            let counts = table.get(branch);
            println!(
                "{}: alpha={} beta={} reliability={:.3}",
                branch,
                counts.alpha,
                counts.beta,
                counts.mean()
            );
        }
    }

    if let Some(object_id) = object_id {
        let path = &config.storage.history_path;
        let mut history = ObjectHistory::load(path).context("Failed to load object history")?;
        let confidence = history.record_feedback(object_id, was_correct);
        history
            .save(path)
            .with_context(|| format!("Failed to save object history {}", path.display()))?;

        println!("{}: confidence={:.3}", object_id, confidence);
    }
    Ok(())
}

/// One cosine branch per query embedding, plus the report-context and
/// object-history branches
fn build_branches(
    descriptor: &QueryDescriptor,
    history: ObjectHistory,
) -> Vec<Arc<dyn BranchScorer>> {
    let mut branches: Vec<Arc<dyn BranchScorer>> = descriptor
        .embeddings
        .keys()
        .map(|key| Arc::new(EmbeddingBranch::new(key.clone(), key.clone())) as Arc<dyn BranchScorer>)
        .collect();
    branches.push(Arc::new(ContextBranch::new()));
    branches.push(Arc::new(HistoryBranch::new(history)));
    branches
}

/// Stream catalog entries lazily; malformed lines are skipped
async fn open_catalog(path: &Path) -> Result<impl Stream<Item = CandidateDescriptor>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open catalog {}", path.display()))?;
    let lines = BufReader::new(file).lines();

    Ok(stream::unfold((lines, 0usize), |(mut lines, mut line_no)| async move {
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<CandidateDescriptor>(&line) {
                    Ok(candidate) => return Some((candidate, (lines, line_no))),
                    Err(e) => warn!(line = line_no, error = %e, "Skipping malformed catalog entry"),
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Catalog read failed, stopping");
                    return None;
                }
            }
        }
    }))
}

async fn print_events_to_stderr(mut rx: mpsc::Receiver<MatchEvent>) {
    while let Some(event) = rx.recv().await {
        if let Ok(line) = serde_json::to_string(&event) {
            eprintln!("{}", line);
        }
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, returning partial result");
        cancel.cancel();
    }
}
