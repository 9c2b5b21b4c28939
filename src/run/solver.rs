//! Solver implementations and the registry that resolves them.
//!
//! A solver turns one sample into a final answer using the `ask` capability
//! bound to the model gateway. Custom solvers are a manifest path resolved
//! through an explicit loader boundary, not ambient dynamic loading.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ValidationError;
use crate::gateway::{FallbackChain, ModelGateway};
use crate::run::episode::{TraceEvent, TraceKind};

/// Input for one sample: the problem text, the expected target (if the
/// grader wants it), and free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleContext {
    pub sample_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SampleContext {
    /// Flatten into the episode's context map.
    pub fn to_context_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = self.metadata.clone();
        map.insert("input".into(), serde_json::Value::String(self.input.clone()));
        if let Some(ref target) = self.target {
            map.insert("target".into(), serde_json::Value::String(target.clone()));
        }
        map
    }
}

/// Everything a solver needs besides the sample itself.
pub struct SolveRequest {
    pub chains: Vec<FallbackChain>,
    /// Join deadline for this sample's model calls.
    pub deadline: Duration,
    /// Lesson guidance retrieved for this run, prepended to prompts.
    pub advice: Vec<String>,
}

/// What a solver produced for one sample. `answer: None` means every model
/// path failed; the engine records the episode as a crash.
#[derive(Debug, Clone)]
pub struct SolveOutput {
    pub answer: Option<String>,
    pub model_used: Option<String>,
    pub tool_calls: u32,
    pub traces: Vec<TraceEvent>,
}

/// Polymorphic solver interface.
#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    async fn solve(
        &self,
        ctx: &SampleContext,
        gateway: &Arc<ModelGateway>,
        req: &SolveRequest,
    ) -> SolveOutput;
}

fn build_prompt(ctx: &SampleContext, advice: &[String]) -> String {
    if advice.is_empty() {
        return ctx.input.clone();
    }
    let mut prompt = String::from("Guidance from prior runs:\n");
    for line in advice {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(&ctx.input);
    prompt
}

/// Record one gateway outcome (success or exhausted chain) as trace events.
fn trace_gateway_outcome(
    traces: &mut Vec<TraceEvent>,
    chain: &FallbackChain,
    outcome: &Result<crate::gateway::GatewayReply, crate::errors::GatewayError>,
) {
    match outcome {
        Ok(reply) => {
            for attempt in &reply.failed_attempts {
                traces.push(TraceEvent::new(
                    TraceKind::ModelError,
                    format!("{}: {}", attempt.model, attempt.error),
                ));
            }
            traces.push(TraceEvent::new(
                TraceKind::ModelReply,
                format!("{} answered in {}ms", reply.model, reply.latency_ms),
            ));
        }
        Err(crate::errors::GatewayError::AllModelsFailed { attempts }) => {
            for attempt in attempts {
                traces.push(TraceEvent::new(
                    TraceKind::ModelError,
                    format!("{}: {}", attempt.model, attempt.error),
                ));
            }
            traces.push(TraceEvent::new(
                TraceKind::Note,
                format!("chain {} exhausted", chain.primary()),
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Grading collaborator
// ---------------------------------------------------------------------------

/// Pass/fail plus a score in `[0, 1]` for one produced answer.
#[derive(Debug, Clone, Copy)]
pub struct GradeResult {
    pub passed: bool,
    pub score: f64,
}

/// Grading is supplied per benchmark; the engine only consumes the verdict.
pub trait Grader: Send + Sync {
    fn grade(&self, sample: &SampleContext, answer: &str) -> GradeResult;
}

/// Default grader: normalized exact match against the sample target.
/// Samples without a target cannot pass under this grader.
pub struct ExactMatchGrader;

impl Grader for ExactMatchGrader {
    fn grade(&self, sample: &SampleContext, answer: &str) -> GradeResult {
        let passed = match sample.target {
            Some(ref target) => answer.trim().eq_ignore_ascii_case(target.trim()),
            None => false,
        };
        GradeResult {
            passed,
            score: if passed { 1.0 } else { 0.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline solver
// ---------------------------------------------------------------------------

/// Single-model solver: one ask against the first configured slot.
pub struct BaselineSolver;

#[async_trait]
impl Solver for BaselineSolver {
    fn name(&self) -> &str {
        "baseline"
    }

    async fn solve(
        &self,
        ctx: &SampleContext,
        gateway: &Arc<ModelGateway>,
        req: &SolveRequest,
    ) -> SolveOutput {
        let chain = &req.chains[0];
        let prompt = build_prompt(ctx, &req.advice);
        let mut traces = vec![TraceEvent::new(
            TraceKind::ModelCall,
            format!("asking {}", chain.primary()),
        )];

        let outcome = gateway.ask(chain, &prompt).await;
        trace_gateway_outcome(&mut traces, chain, &outcome);

        match outcome {
            Ok(reply) => SolveOutput {
                answer: Some(reply.text),
                model_used: Some(reply.model),
                tool_calls: 0,
                traces,
            },
            Err(_) => SolveOutput {
                answer: None,
                model_used: None,
                tool_calls: 0,
                traces,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Multi-model solver
// ---------------------------------------------------------------------------

/// Fan out to every configured slot concurrently, then synthesize one final
/// answer from the non-failed responses by majority vote on the normalized
/// text (ties go to the earliest slot). One slot's failure never aborts the
/// others; slots past the join deadline count as failed but their in-flight
/// tasks are left to finish detached, results discarded.
pub struct MultiModelSolver;

fn normalize_answer(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Majority vote over (slot_index, answer) pairs; ties break toward the
/// lowest slot index holding a winning answer.
fn synthesize(replies: &[(usize, String)]) -> Option<(usize, String)> {
    if replies.is_empty() {
        return None;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, answer) in replies {
        *counts.entry(normalize_answer(answer)).or_insert(0) += 1;
    }
    let best_count = *counts.values().max()?;
    replies
        .iter()
        .find(|(_, answer)| counts[&normalize_answer(answer)] == best_count)
        .map(|(idx, answer)| (*idx, answer.clone()))
}

#[async_trait]
impl Solver for MultiModelSolver {
    fn name(&self) -> &str {
        "multi"
    }

    async fn solve(
        &self,
        ctx: &SampleContext,
        gateway: &Arc<ModelGateway>,
        req: &SolveRequest,
    ) -> SolveOutput {
        let prompt = build_prompt(ctx, &req.advice);
        let mut traces = Vec::new();

        let mut handles = Vec::new();
        for (idx, chain) in req.chains.iter().enumerate() {
            traces.push(TraceEvent::new(
                TraceKind::ModelCall,
                format!("asking {}", chain.primary()),
            ));
            let gw = gateway.clone();
            let chain = chain.clone();
            let prompt = prompt.clone();
            handles.push((
                idx,
                chain.clone(),
                tokio::spawn(async move { gw.ask(&chain, &prompt).await }),
            ));
        }

        // One shared join deadline for the whole sample, not per slot.
        let join_deadline = tokio::time::Instant::now() + req.deadline;
        let joined = join_all(handles.into_iter().map(|(idx, chain, handle)| async move {
            (idx, chain, tokio::time::timeout_at(join_deadline, handle).await)
        }))
        .await;

        let mut replies: Vec<(usize, String)> = Vec::new();
        let mut models: HashMap<usize, String> = HashMap::new();
        for (idx, chain, joined_outcome) in joined {
            match joined_outcome {
                Ok(Ok(outcome)) => {
                    trace_gateway_outcome(&mut traces, &chain, &outcome);
                    if let Ok(reply) = outcome {
                        models.insert(idx, reply.model);
                        replies.push((idx, reply.text));
                    }
                }
                Ok(Err(join_err)) => {
                    warn!("model task for {} aborted: {}", chain.primary(), join_err);
                    traces.push(TraceEvent::new(
                        TraceKind::ModelError,
                        format!("{}: task aborted", chain.primary()),
                    ));
                }
                Err(_) => {
                    // Straggler: failed for synthesis, task left in flight.
                    traces.push(TraceEvent::new(
                        TraceKind::Timeout,
                        format!("{} missed the join deadline", chain.primary()),
                    ));
                }
            }
        }

        match synthesize(&replies) {
            Some((idx, answer)) => {
                debug!(
                    "synthesized answer from {} of {} slots",
                    replies.len(),
                    req.chains.len()
                );
                SolveOutput {
                    answer: Some(answer),
                    model_used: models.remove(&idx),
                    tool_calls: 0,
                    traces,
                }
            }
            None => SolveOutput {
                answer: None,
                model_used: None,
                tool_calls: 0,
                traces,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Custom solver
// ---------------------------------------------------------------------------

/// On-disk manifest for a custom solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverManifest {
    pub name: String,
    /// Prompt template; `{input}` is replaced with the sample input.
    pub prompt_template: String,
}

/// A solver defined by an on-disk manifest.
pub struct CustomSolver {
    manifest: SolverManifest,
}

impl CustomSolver {
    /// Loader boundary: read and validate the manifest, or fail with a
    /// validation error before any run starts.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ValidationError::BadSolverManifest(format!("{}: {}", path.display(), e)))?;
        let manifest: SolverManifest = serde_json::from_str(&contents)
            .map_err(|e| ValidationError::BadSolverManifest(format!("{}: {}", path.display(), e)))?;
        if !manifest.prompt_template.contains("{input}") {
            return Err(ValidationError::BadSolverManifest(format!(
                "{}: promptTemplate has no {{input}} placeholder",
                path.display()
            )));
        }
        Ok(Self { manifest })
    }
}

#[async_trait]
impl Solver for CustomSolver {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    async fn solve(
        &self,
        ctx: &SampleContext,
        gateway: &Arc<ModelGateway>,
        req: &SolveRequest,
    ) -> SolveOutput {
        let rendered = self.manifest.prompt_template.replace("{input}", &ctx.input);
        let templated = SampleContext {
            input: rendered,
            ..ctx.clone()
        };
        BaselineSolver.solve(&templated, gateway, req).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The registered solver variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverKind {
    Baseline,
    MultiModel,
    Custom(PathBuf),
}

impl SolverKind {
    /// Parse a solver spec: `baseline`, `multi`, or `custom:<path>`.
    pub fn parse(spec: &str) -> Result<Self, ValidationError> {
        match spec {
            "baseline" => Ok(SolverKind::Baseline),
            "multi" => Ok(SolverKind::MultiModel),
            other => match other.strip_prefix("custom:") {
                Some(path) if !path.is_empty() => Ok(SolverKind::Custom(PathBuf::from(path))),
                _ => Err(ValidationError::UnknownSolver(other.to_string())),
            },
        }
    }
}

/// Resolve a solver kind into an instance. Custom manifests are loaded and
/// validated here, so resolution failures surface during SETUP.
pub fn resolve_solver(kind: &SolverKind) -> Result<Arc<dyn Solver>, ValidationError> {
    match kind {
        SolverKind::Baseline => Ok(Arc::new(BaselineSolver)),
        SolverKind::MultiModel => Ok(Arc::new(MultiModelSolver)),
        SolverKind::Custom(path) => Ok(Arc::new(CustomSolver::load(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RateLimiter;
    use crate::providers::base::{ModelProvider, ModelReply};
    use anyhow::Result;

    struct StubProvider;

    #[async_trait]
    impl ModelProvider for StubProvider {
        async fn complete(
            &self,
            model: &str,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<ModelReply> {
            if model.starts_with("fail") {
                anyhow::bail!("simulated failure");
            }
            if model.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            // `answers-X` responds with "X".
            let text = model
                .strip_prefix("answers-")
                .unwrap_or(model)
                .to_string();
            Ok(ModelReply {
                text,
                usage: Default::default(),
            })
        }

        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    fn gateway() -> Arc<ModelGateway> {
        let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        providers.insert("stub".into(), Arc::new(StubProvider));
        Arc::new(ModelGateway::new(
            providers,
            Arc::new(RateLimiter::new(1000.0, 1000.0)),
            "stub",
            Duration::from_secs(5),
            256,
            0.0,
        ))
    }

    fn chain(model: &str) -> FallbackChain {
        FallbackChain::new(vec![model.to_string()]).unwrap()
    }

    fn request(chains: Vec<FallbackChain>) -> SolveRequest {
        SolveRequest {
            chains,
            deadline: Duration::from_millis(100),
            advice: vec![],
        }
    }

    fn sample(input: &str) -> SampleContext {
        SampleContext {
            sample_id: "s0".into(),
            input: input.into(),
            target: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_solver_kind_parse() {
        assert_eq!(SolverKind::parse("baseline").unwrap(), SolverKind::Baseline);
        assert_eq!(SolverKind::parse("multi").unwrap(), SolverKind::MultiModel);
        assert_eq!(
            SolverKind::parse("custom:/tmp/s.json").unwrap(),
            SolverKind::Custom(PathBuf::from("/tmp/s.json"))
        );
        assert!(SolverKind::parse("nope").is_err());
        assert!(SolverKind::parse("custom:").is_err());
    }

    #[test]
    fn test_custom_loader_rejects_missing_and_bad_manifests() {
        assert!(CustomSolver::load(Path::new("/tmp/evalbot_no_such_manifest.json")).is_err());

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("solver.json");
        fs::write(&path, r#"{"name":"t","promptTemplate":"no placeholder"}"#).unwrap();
        assert!(CustomSolver::load(&path).is_err());

        fs::write(&path, r#"{"name":"t","promptTemplate":"Q: {input}"}"#).unwrap();
        assert!(CustomSolver::load(&path).is_ok());
    }

    #[test]
    fn test_synthesize_majority_and_tie_break() {
        let replies = vec![
            (0, "B".to_string()),
            (1, "a".to_string()),
            (2, "A ".to_string()),
        ];
        // "a" normalized wins 2-1.
        let (idx, answer) = synthesize(&replies).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(answer, "a");

        // Tie: earliest slot wins.
        let tied = vec![(0, "x".to_string()), (1, "y".to_string())];
        let (idx, answer) = synthesize(&tied).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(answer, "x");

        assert!(synthesize(&[]).is_none());
    }

    #[tokio::test]
    async fn test_baseline_solver_answers() {
        let out = BaselineSolver
            .solve(&sample("2+2?"), &gateway(), &request(vec![chain("answers-4")]))
            .await;
        assert_eq!(out.answer.as_deref(), Some("4"));
        assert_eq!(out.model_used.as_deref(), Some("answers-4"));
        assert!(out.traces.iter().any(|t| t.kind == TraceKind::ModelReply));
    }

    #[tokio::test]
    async fn test_baseline_solver_all_failed() {
        let out = BaselineSolver
            .solve(&sample("q"), &gateway(), &request(vec![chain("fail-x")]))
            .await;
        assert!(out.answer.is_none());
        assert!(out.traces.iter().any(|t| t.kind == TraceKind::ModelError));
    }

    #[tokio::test]
    async fn test_multi_model_votes_across_slots() {
        let req = request(vec![
            chain("answers-7"),
            chain("answers-9"),
            chain("answers-7 "),
        ]);
        let out = MultiModelSolver.solve(&sample("q"), &gateway(), &req).await;
        assert_eq!(out.answer.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_multi_model_survives_one_failure() {
        let req = request(vec![chain("fail-a"), chain("answers-5")]);
        let out = MultiModelSolver.solve(&sample("q"), &gateway(), &req).await;
        assert_eq!(out.answer.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_multi_model_straggler_discarded() {
        // "slow" sleeps past the 100ms join deadline.
        let req = request(vec![chain("slow-answers-1"), chain("answers-2")]);
        let out = MultiModelSolver.solve(&sample("q"), &gateway(), &req).await;
        assert_eq!(out.answer.as_deref(), Some("2"));
        assert!(out.traces.iter().any(|t| t.kind == TraceKind::Timeout));
    }

    #[tokio::test]
    async fn test_multi_model_all_failed() {
        let req = request(vec![chain("fail-a"), chain("fail-b")]);
        let out = MultiModelSolver.solve(&sample("q"), &gateway(), &req).await;
        assert!(out.answer.is_none());
    }

    #[tokio::test]
    async fn test_custom_solver_renders_template() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("solver.json");
        fs::write(
            &path,
            r#"{"name":"echo-q","promptTemplate":"Question: {input}"}"#,
        )
        .unwrap();
        let solver = CustomSolver::load(&path).unwrap();
        assert_eq!(solver.name(), "echo-q");

        let out = solver
            .solve(&sample("2+2?"), &gateway(), &request(vec![chain("answers-4")]))
            .await;
        assert_eq!(out.answer.as_deref(), Some("4"));
    }

    #[test]
    fn test_prompt_includes_advice() {
        let ctx = sample("what is 2+2?");
        let advice = vec!["check arithmetic twice".to_string()];
        let prompt = build_prompt(&ctx, &advice);
        assert!(prompt.contains("check arithmetic twice"));
        assert!(prompt.ends_with("what is 2+2?"));
    }
}
