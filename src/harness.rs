//! Programmatic facade over the harness core.
//!
//! Exposes the operations the CLI front end maps onto: run, status,
//! results, compare, analyze, learn, and the lesson lifecycle. Owns the
//! wired-together gateway, stores, and engines for one data directory.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::loader;
use crate::config::schema::{Config, ModelSlot};
use crate::gateway::{ModelGateway, RateLimiter};
use crate::learning::{CandidateLesson, LearningEngine, LessonCard, LessonStats, LessonStore};
use crate::providers::build_providers;
use crate::run::engine::{RunRequest, SolverEngine};
use crate::run::solver::{Grader, SampleContext};
use crate::run::state::{Phase, Run};
use crate::run::store::RunStore;
use crate::stats::{compare, run_report, Comparison, RunReport};

/// One line of `status` output.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub id: String,
    pub phase: Phase,
    pub n_total: usize,
    pub n_passed: usize,
}

pub struct Harness {
    config: Config,
    store: RunStore,
    engine: SolverEngine,
    learning: LearningEngine,
}

impl Harness {
    /// Wire the harness from configuration.
    pub fn new(config: Config) -> Self {
        let data = loader::data_dir(&config);
        let providers = build_providers(&config.providers);

        let limiter = Arc::new(RateLimiter::new(10.0, 2.0));
        for (id, endpoint) in &config.providers.endpoints {
            limiter.set_budget(id, endpoint.rate_capacity, endpoint.rate_refill_per_sec);
        }

        let gateway = Arc::new(ModelGateway::new(
            providers,
            limiter,
            &config.providers.default_provider,
            Duration::from_secs(config.run.ask_timeout_secs),
            config.run.max_response_tokens,
            config.run.temperature,
        ));

        let store = RunStore::new(&data.join("runs"));
        let engine = SolverEngine::new(
            gateway,
            store.clone(),
            config.run.clone(),
            config.stats.confidence,
        );
        let learning = LearningEngine::new(LessonStore::new(&data), config.learning.clone());

        Self {
            config,
            store,
            engine,
            learning,
        }
    }

    /// Execute a run end to end. Applicable approved lessons are retrieved
    /// up front and fed to solvers as guidance.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &mut self,
        benchmark: &str,
        solver_spec: &str,
        samples: Vec<SampleContext>,
        slots: Vec<ModelSlot>,
        grader: Arc<dyn Grader>,
        analyze: bool,
        learn: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<Run> {
        let advice = self.advice_for(benchmark, &samples);
        if !advice.is_empty() {
            debug!("applying {} retrieved lessons to run", advice.len());
        }
        let request = RunRequest {
            benchmark: benchmark.to_string(),
            solver_spec: solver_spec.to_string(),
            samples,
            slots,
            advice,
            analyze,
            learn,
        };
        self.engine
            .execute_run(request, grader, cancel, Some(&mut self.learning))
            .await
    }

    /// Trigger-match approved lessons against the benchmark and a prefix of
    /// the sample inputs.
    fn advice_for(&self, benchmark: &str, samples: &[SampleContext]) -> Vec<String> {
        let mut query = benchmark.to_string();
        for sample in samples.iter().take(3) {
            query.push(' ');
            query.push_str(&sample.input);
        }
        self.learning
            .retrieve(&query)
            .into_iter()
            .map(|card| card.content)
            .collect()
    }

    /// Status of one run, or of every run in the store.
    pub fn status(&self, run_id: Option<&str>) -> Result<Vec<RunStatus>> {
        let ids = match run_id {
            Some(id) => vec![id.to_string()],
            None => self.store.list_runs(),
        };
        let mut statuses = Vec::new();
        for id in ids {
            let run = self.store.load_run(&id)?;
            statuses.push(RunStatus {
                id: run.id,
                phase: run.phase,
                n_total: run.n_total,
                n_passed: run.n_passed,
            });
        }
        Ok(statuses)
    }

    /// Aggregate results for a run: the saved report when present,
    /// recomputed otherwise.
    pub fn results(&self, run_id: &str) -> Result<RunReport> {
        if let Some(report) = self.store.load_report(run_id)? {
            return Ok(report);
        }
        let run = self.store.load_run(run_id)?;
        run_report(&run, self.config.stats.confidence).context("report unavailable")
    }

    /// Statistical comparison of two runs; errors mean "comparison
    /// unavailable", not a harness failure.
    pub fn compare(&self, run_a: &str, run_b: &str) -> Result<Comparison> {
        let a = self.store.load_run(run_a)?;
        let b = self.store.load_run(run_b)?;
        compare(&a, &b, self.config.stats.confidence).context("comparison unavailable")
    }

    /// Recompute and persist a run's analysis report.
    pub fn analyze(&self, run_id: &str) -> Result<RunReport> {
        let run = self.store.load_run(run_id)?;
        let report = run_report(&run, self.config.stats.confidence)?;
        self.store.save_report(run_id, &report)?;
        Ok(report)
    }

    /// Extract lesson candidates from a completed run.
    pub fn learn(&mut self, run_id: &str) -> Result<Vec<CandidateLesson>> {
        let run = self.store.load_run(run_id)?;
        self.learning.extract(&run)
    }

    // -- Lesson lifecycle ---------------------------------------------------

    pub fn lesson_candidates(&self) -> Vec<&CandidateLesson> {
        self.learning.candidates()
    }

    pub fn lessons_approved(&self) -> Vec<&LessonCard> {
        self.learning.approved()
    }

    pub fn approve_lesson(&mut self, hash: &str) -> Result<LessonCard> {
        self.learning.approve(hash)
    }

    pub fn reject_lesson(&mut self, hash: &str) -> Result<()> {
        self.learning.reject(hash)
    }

    pub fn lesson_stats(&self) -> LessonStats {
        self.learning.stats()
    }

    pub fn archive_stale_lessons(&mut self) -> Result<usize> {
        self.learning.archive_stale(chrono::Utc::now())
    }

    pub fn unarchive_lesson(&mut self, hash: &str) -> Result<()> {
        self.learning.unarchive(hash)
    }
}
