//! Solver execution engine.
//!
//! Fans a run's samples out across a bounded worker pool, collects each
//! sample's solver output into an Episode, and commits episodes to the
//! durable log in submission order regardless of completion order.
//! Per-sample failures are contained at the sample boundary and encoded as
//! Episode outcomes; only infrastructure failures abort the run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::schema::{ModelSlot, RunConfig};
use crate::errors::ValidationError;
use crate::gateway::{FallbackChain, ModelGateway};
use crate::learning::engine::LearningEngine;
use crate::run::episode::{Action, Episode, Outcome, TraceEvent, TraceKind};
use crate::run::solver::{
    resolve_solver, Grader, SampleContext, Solver, SolveOutput, SolveRequest, SolverKind,
};
use crate::run::state::{Phase, PhaseGuard, Run, RunStateMachine};
use crate::run::store::RunStore;
use crate::stats::taxonomy::classify_failure;
use crate::stats::{run_report, RunReport};

/// Everything needed to start a run.
pub struct RunRequest {
    pub benchmark: String,
    pub solver_spec: String,
    pub samples: Vec<SampleContext>,
    pub slots: Vec<ModelSlot>,
    /// Lesson guidance retrieved before the run, passed through to solvers.
    pub advice: Vec<String>,
    /// Post-processing phases; both can be skipped.
    pub analyze: bool,
    pub learn: bool,
}

/// Executes runs against the model gateway.
pub struct SolverEngine {
    gateway: Arc<ModelGateway>,
    store: RunStore,
    config: RunConfig,
    confidence: f64,
}

impl SolverEngine {
    pub fn new(
        gateway: Arc<ModelGateway>,
        store: RunStore,
        config: RunConfig,
        confidence: f64,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
            confidence,
        }
    }

    /// SETUP validation: fail fast with a typed error before RUNNING.
    fn validate(&self, req: &RunRequest) -> Result<(Arc<dyn Solver>, Vec<FallbackChain>), ValidationError> {
        if req.benchmark.trim().is_empty() {
            return Err(ValidationError::EmptyBenchmark);
        }
        if req.samples.is_empty() {
            return Err(ValidationError::NoSamples);
        }
        if req.slots.is_empty() {
            return Err(ValidationError::EmptyModelConfig);
        }
        let solver = resolve_solver(&SolverKind::parse(&req.solver_spec)?)?;
        let chains = req
            .slots
            .iter()
            .map(FallbackChain::from_slot)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((solver, chains))
    }

    /// Execute a full run lifecycle. Returns the completed, read-only run.
    ///
    /// `cancel` stops dispatching new samples when set; in-flight samples
    /// drain normally. `learning` enables the LEARNING phase when present
    /// and `req.learn` is set.
    pub async fn execute_run(
        &self,
        req: RunRequest,
        grader: Arc<dyn Grader>,
        cancel: Arc<AtomicBool>,
        mut learning: Option<&mut LearningEngine>,
    ) -> anyhow::Result<Run> {
        let run = Run::new(&req.benchmark, &req.solver_spec, req.slots.clone());
        let run_id = run.id.clone();
        info!("run {} created for benchmark {}", run_id, req.benchmark);

        let sm = Arc::new(Mutex::new(RunStateMachine::new(run, self.store.clone())));
        lock(&sm).transition(Phase::Setup)?;
        let guard = PhaseGuard::arm(sm.clone());

        let (solver, chains) = self.validate(&req)?;
        lock(&sm).transition(Phase::Running)?;

        self.run_samples(&sm, &req, solver, chains, grader, cancel)
            .await?;

        if req.analyze {
            lock(&sm).transition(Phase::Analyzing)?;
            let report = self.analyze(&sm)?;
            if req.learn {
                lock(&sm).transition(Phase::Learning)?;
                if let Some(engine) = learning.as_deref_mut() {
                    let run = lock(&sm).run().clone();
                    let lessons = engine.extract(&run)?;
                    info!("run {} extracted {} lesson candidates", run_id, lessons.len());
                }
            }
            debug!(
                "run {} report: {}/{} passed",
                run_id, report.n_passed, report.n_total
            );
        }

        lock(&sm).transition(Phase::Idle)?;
        guard.disarm();

        let completed = lock(&sm).run().clone();
        info!(
            "run {} complete: {}/{} passed",
            completed.id, completed.n_passed, completed.n_total
        );
        Ok(completed)
    }

    /// RUNNING phase: bounded fan-out with in-order episode commits.
    async fn run_samples(
        &self,
        sm: &Arc<Mutex<RunStateMachine>>,
        req: &RunRequest,
        solver: Arc<dyn Solver>,
        chains: Vec<FallbackChain>,
        grader: Arc<dyn Grader>,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let run_id = lock(sm).run().id.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_samples.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Episode)>();
        let solve_req = Arc::new(SolveRequest {
            chains,
            deadline: Duration::from_secs(self.config.sample_deadline_secs),
            advice: req.advice.clone(),
        });
        let sample_deadline = Duration::from_secs(self.config.sample_deadline_secs);

        for (index, sample) in req.samples.iter().cloned().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!("run {} cancelled, stopping dispatch at sample {}", run_id, index);
                break;
            }
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let solver = solver.clone();
            let gateway = self.gateway.clone();
            let grader = grader.clone();
            let solve_req = solve_req.clone();
            let run_id = run_id.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let output =
                    match tokio::time::timeout(sample_deadline, solver.solve(&sample, &gateway, &solve_req))
                        .await
                    {
                        Ok(output) => output,
                        Err(_) => SolveOutput {
                            answer: None,
                            model_used: None,
                            tool_calls: 0,
                            traces: vec![TraceEvent::new(
                                TraceKind::Timeout,
                                format!("sample deadline of {:?} elapsed", sample_deadline),
                            )],
                        },
                    };
                let episode = build_episode(&run_id, &sample, index, output, grader.as_ref());
                let _ = tx.send((index, episode));
            });
        }
        drop(tx);

        // Commit completions in submission order: buffer until the
        // predecessor index has been written.
        let mut pending: BTreeMap<usize, Episode> = BTreeMap::new();
        let mut next_index = 0usize;
        while let Some((index, episode)) = rx.recv().await {
            pending.insert(index, episode);
            while let Some(ready) = pending.remove(&next_index) {
                lock(sm).append_episode(ready)?;
                next_index += 1;
            }
        }
        // A gap can only remain if a worker died without reporting; commit
        // whatever arrived so the log stays inspectable.
        for (index, episode) in std::mem::take(&mut pending) {
            warn!("committing episode {} after gap in completion order", index);
            lock(sm).append_episode(episode)?;
        }
        Ok(())
    }

    /// ANALYZING phase: aggregate the run and persist the report beside it.
    fn analyze(&self, sm: &Arc<Mutex<RunStateMachine>>) -> anyhow::Result<RunReport> {
        let run = lock(sm).run().clone();
        let report = run_report(&run, self.confidence)?;
        self.store.save_report(&run.id, &report)?;
        Ok(report)
    }
}

fn lock<'a>(sm: &'a Arc<Mutex<RunStateMachine>>) -> std::sync::MutexGuard<'a, RunStateMachine> {
    match sm.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Assemble one sample's episode: grade the answer if one was produced,
/// classify the failure mode otherwise. The episode is fully constructed in
/// memory before it is appended.
fn build_episode(
    run_id: &str,
    sample: &SampleContext,
    index: usize,
    output: SolveOutput,
    grader: &dyn Grader,
) -> Episode {
    let mut traces = output.traces;
    let (action, outcome) = match output.answer {
        Some(answer) => {
            let grade = grader.grade(sample, &answer);
            traces.push(TraceEvent::new(
                TraceKind::Grade,
                format!("passed={} score={:.3}", grade.passed, grade.score),
            ));
            (
                Action {
                    answer,
                    tool_calls: output.tool_calls,
                },
                Outcome {
                    passed: grade.passed,
                    score: grade.score.clamp(0.0, 1.0),
                    failure_mode: None,
                },
            )
        }
        None => (
            Action {
                answer: String::new(),
                tool_calls: output.tool_calls,
            },
            Outcome {
                passed: false,
                score: 0.0,
                failure_mode: None,
            },
        ),
    };

    let mut episode = Episode::new(
        run_id,
        &sample.sample_id,
        index,
        sample.to_context_map(),
        traces,
        action,
        outcome,
    );
    if !episode.outcome.passed {
        episode.outcome.failure_mode = Some(classify_failure(&episode));
    }
    episode
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RateLimiter;
    use crate::providers::base::{ModelProvider, ModelReply};
    use crate::run::episode::FailureMode;
    use crate::run::solver::{ExactMatchGrader, GradeResult};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Stub whose response depends on the prompt: `ret:<x>` answers `x`,
    /// `boom` fails, `sleep:<ms>` delays then answers "late".
    struct PromptedProvider;

    #[async_trait]
    impl ModelProvider for PromptedProvider {
        async fn complete(
            &self,
            _model: &str,
            prompt: &str,
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<ModelReply> {
            let directive = prompt.lines().last().unwrap_or("");
            if directive == "boom" {
                anyhow::bail!("simulated provider failure");
            }
            if let Some(ms) = directive.strip_prefix("sleep:") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                return Ok(ModelReply {
                    text: "late".into(),
                    usage: Default::default(),
                });
            }
            let text = directive.strip_prefix("ret:").unwrap_or(directive).to_string();
            Ok(ModelReply {
                text,
                usage: Default::default(),
            })
        }

        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    fn engine(tmp: &TempDir, config: RunConfig) -> SolverEngine {
        let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        providers.insert("stub".into(), Arc::new(PromptedProvider));
        let gateway = Arc::new(ModelGateway::new(
            providers,
            Arc::new(RateLimiter::new(1000.0, 1000.0)),
            "stub",
            Duration::from_secs(5),
            256,
            0.0,
        ));
        SolverEngine::new(gateway, RunStore::new(tmp.path()), config, 0.95)
    }

    fn sample(id: &str, input: &str, target: &str) -> SampleContext {
        SampleContext {
            sample_id: id.into(),
            input: input.into(),
            target: Some(target.into()),
            metadata: HashMap::new(),
        }
    }

    fn request(samples: Vec<SampleContext>) -> RunRequest {
        RunRequest {
            benchmark: "arith".into(),
            solver_spec: "baseline".into(),
            samples,
            slots: vec![ModelSlot {
                model: "m".into(),
                fallback: vec![],
            }],
            advice: vec![],
            analyze: false,
            learn: false,
        }
    }

    #[tokio::test]
    async fn test_run_completes_and_counts() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(&tmp, RunConfig::default());
        let samples = vec![
            sample("s0", "ret:4", "4"),
            sample("s1", "ret:9", "7"), // wrong
            sample("s2", "ret:1", "1"),
        ];
        let run = eng
            .execute_run(
                request(samples),
                Arc::new(ExactMatchGrader),
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.phase, Phase::Idle);
        assert_eq!(run.n_total, 3);
        assert_eq!(run.n_passed, 2);
        assert_eq!(
            run.episodes[1].outcome.failure_mode,
            Some(FailureMode::WrongAnswer)
        );
    }

    #[tokio::test]
    async fn test_persisted_order_matches_submission_order() {
        let tmp = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.max_parallel_samples = 4;
        config.sample_deadline_secs = 5;
        let eng = engine(&tmp, config);

        // Sample 0 is the slowest; completion order is 1,2,3,0.
        let samples = vec![
            sample("s0", "sleep:150", "late"),
            sample("s1", "ret:a", "a"),
            sample("s2", "ret:b", "b"),
            sample("s3", "ret:c", "c"),
        ];
        let run = eng
            .execute_run(
                request(samples),
                Arc::new(ExactMatchGrader),
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await
            .unwrap();

        // Check the raw persisted line order, not the sorted reload.
        let raw = std::fs::read_to_string(tmp.path().join(&run.id).join("episodes.jsonl")).unwrap();
        let ids: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<Episode>(l).unwrap().sample_id)
            .collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn test_all_models_failed_is_crash_episode_not_abort() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(&tmp, RunConfig::default());
        let samples = vec![sample("s0", "boom", "x"), sample("s1", "ret:y", "y")];
        let run = eng
            .execute_run(
                request(samples),
                Arc::new(ExactMatchGrader),
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.n_total, 2);
        assert_eq!(run.n_passed, 1);
        assert_eq!(
            run.episodes[0].outcome.failure_mode,
            Some(FailureMode::Crash)
        );
    }

    #[tokio::test]
    async fn test_validation_failure_restores_idle() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(&tmp, RunConfig::default());
        let mut req = request(vec![sample("s0", "ret:1", "1")]);
        req.solver_spec = "no-such-solver".into();

        let err = eng
            .execute_run(
                req,
                Arc::new(ExactMatchGrader),
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());

        // The persisted run record ended back at idle.
        let store = RunStore::new(tmp.path());
        let ids = store.list_runs();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.load_run(&ids[0]).unwrap().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let tmp = TempDir::new().unwrap();
        let eng = engine(&tmp, RunConfig::default());
        let cancel = Arc::new(AtomicBool::new(true));
        let run = eng
            .execute_run(
                request(vec![sample("s0", "ret:1", "1"), sample("s1", "ret:2", "2")]),
                Arc::new(ExactMatchGrader),
                cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(run.n_total, 0);
        assert_eq!(run.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_sample_deadline_produces_timeout_episode() {
        let tmp = TempDir::new().unwrap();
        let mut config = RunConfig::default();
        config.sample_deadline_secs = 1;
        let eng = engine(&tmp, config);

        let run = eng
            .execute_run(
                request(vec![sample("s0", "sleep:1400", "late")]),
                Arc::new(ExactMatchGrader),
                Arc::new(AtomicBool::new(false)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            run.episodes[0].outcome.failure_mode,
            Some(FailureMode::Timeout)
        );
    }

    #[test]
    fn test_build_episode_grades_and_classifies() {
        struct AlwaysFailGrader;
        impl Grader for AlwaysFailGrader {
            fn grade(&self, _sample: &SampleContext, _answer: &str) -> GradeResult {
                GradeResult {
                    passed: false,
                    score: 0.0,
                }
            }
        }

        let output = SolveOutput {
            answer: Some("wrong".into()),
            model_used: Some("m".into()),
            tool_calls: 2,
            traces: vec![],
        };
        let ep = build_episode(
            "r1",
            &sample("s0", "q", "right"),
            0,
            output,
            &AlwaysFailGrader,
        );
        assert!(!ep.outcome.passed);
        assert_eq!(ep.outcome.failure_mode, Some(FailureMode::WrongAnswer));
        assert_eq!(ep.action.tool_calls, 2);
        assert!(ep.has_trace(TraceKind::Grade));
    }
}
