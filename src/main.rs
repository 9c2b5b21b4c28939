//! evalbot - evaluation harness for AI-model solvers.
//!
//! Thin CLI over the library: argument parsing and presentation only.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use evalbot::config::loader::load_config;
use evalbot::config::schema::ModelSlot;
use evalbot::harness::Harness;
use evalbot::run::solver::{ExactMatchGrader, SampleContext};

pub(crate) const VERSION: &str = "0.1.0";

#[derive(Parser)]
#[command(name = "evalbot", about = "evalbot - Solver Evaluation Harness", version = VERSION)]
struct Cli {
    /// Path to the config file (default: ~/.evalbot/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run: one solver against one benchmark's samples.
    Run {
        /// Benchmark id.
        #[arg(short, long)]
        benchmark: String,
        /// Solver spec: `baseline`, `multi`, or `custom:<manifest path>`.
        #[arg(short, long, default_value = "baseline")]
        solver: String,
        /// Path to a JSON file with the samples array.
        #[arg(long)]
        samples: PathBuf,
        /// Model id for the primary slot (repeat for multi-model slots).
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,
        /// Fallback model ids appended to every slot's chain.
        #[arg(long = "fallback")]
        fallbacks: Vec<String>,
        /// Skip the analyzing phase.
        #[arg(long)]
        no_analyze: bool,
        /// Extract lesson candidates after analysis.
        #[arg(long)]
        learn: bool,
    },
    /// Show run phases and counters.
    Status {
        run_id: Option<String>,
    },
    /// Show a run's aggregate report.
    Results {
        run_id: String,
    },
    /// Statistically compare two runs.
    Compare {
        run_a: String,
        run_b: String,
    },
    /// Recompute a run's analysis report.
    Analyze {
        run_id: String,
    },
    /// Extract lesson candidates from a run's failures.
    Learn {
        run_id: String,
    },
    /// Inspect and curate the lesson stores.
    Lessons {
        /// List candidates instead of approved lessons.
        #[arg(long)]
        candidates: bool,
        /// Approve the candidate with this content hash.
        #[arg(long)]
        approve: Option<String>,
        /// Reject the candidate with this content hash.
        #[arg(long)]
        reject: Option<String>,
        /// Show lesson store counters.
        #[arg(long)]
        stats: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_samples(path: &PathBuf) -> Result<Vec<SampleContext>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read samples from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse samples from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    let mut harness = Harness::new(config);

    match cli.command {
        Commands::Run {
            benchmark,
            solver,
            samples,
            models,
            fallbacks,
            no_analyze,
            learn,
        } => {
            let samples = load_samples(&samples)?;
            let slots: Vec<ModelSlot> = models
                .into_iter()
                .map(|model| ModelSlot {
                    model,
                    fallback: fallbacks.clone(),
                })
                .collect();
            let run = harness
                .run(
                    &benchmark,
                    &solver,
                    samples,
                    slots,
                    Arc::new(ExactMatchGrader),
                    !no_analyze,
                    learn,
                    Arc::new(AtomicBool::new(false)),
                )
                .await?;
            println!(
                "run {} finished: {}/{} passed",
                run.id, run.n_passed, run.n_total
            );
        }
        Commands::Status { run_id } => {
            for status in harness.status(run_id.as_deref())? {
                println!(
                    "{}  {}  {}/{} passed",
                    status.id, status.phase, status.n_passed, status.n_total
                );
            }
        }
        Commands::Results { run_id } => {
            let report = harness.results(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Compare { run_a, run_b } => match harness.compare(&run_a, &run_b) {
            Ok(comparison) => println!("{}", serde_json::to_string_pretty(&comparison)?),
            Err(e) => println!("comparison unavailable: {:#}", e),
        },
        Commands::Analyze { run_id } => {
            let report = harness.analyze(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Learn { run_id } => {
            let lessons = harness.learn(&run_id)?;
            println!("{} lesson candidates", lessons.len());
            for lesson in lessons {
                println!("{}  {}", &lesson.content_hash[..12], lesson.content);
            }
        }
        Commands::Lessons {
            candidates,
            approve,
            reject,
            stats,
        } => {
            if let Some(hash) = approve {
                let card = harness.approve_lesson(&hash)?;
                println!("approved {} (confidence {:.2})", hash, card.confidence);
            } else if let Some(hash) = reject {
                harness.reject_lesson(&hash)?;
                println!("rejected {}", hash);
            } else if stats {
                let s = harness.lesson_stats();
                println!(
                    "candidates: {}  approved: {}  archived: {}  applications: {}  mean confidence: {:.2}",
                    s.n_candidates, s.n_approved, s.n_archived, s.total_applications, s.mean_confidence
                );
            } else if candidates {
                for lesson in harness.lesson_candidates() {
                    println!(
                        "{}  {:.0}%  {}",
                        &lesson.content_hash[..12],
                        lesson.failure_proportion * 100.0,
                        lesson.content
                    );
                }
            } else {
                for card in harness.lessons_approved() {
                    let flag = if card.archived { " [archived]" } else { "" };
                    println!(
                        "{}  conf {:.2}  applied {}x{}  {}",
                        &card.content_hash[..12],
                        card.confidence,
                        card.application_count,
                        flag,
                        card.content
                    );
                }
            }
        }
    }

    Ok(())
}
