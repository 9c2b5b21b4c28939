//! Episode records: the immutable per-sample unit of evaluation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Returns current time as ISO 8601 string.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// What kind of event a trace entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    ModelCall,
    ModelReply,
    ModelError,
    RateLimit,
    Timeout,
    CostLimit,
    Grade,
    Note,
}

/// One timestamped model/tool event inside an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: String,
    pub kind: TraceKind,
    pub detail: String,
}

impl TraceEvent {
    pub fn new(kind: TraceKind, detail: impl Into<String>) -> Self {
        Self {
            at: now_timestamp(),
            kind,
            detail: detail.into(),
        }
    }
}

/// The solver's final output for one sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub answer: String,
    pub tool_calls: u32,
}

/// Failure taxonomy. Exactly one mode per failed episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    WrongAnswer,
    Timeout,
    Crash,
    CostLimit,
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureMode::WrongAnswer => "wrong_answer",
            FailureMode::Timeout => "timeout",
            FailureMode::Crash => "crash",
            FailureMode::CostLimit => "cost_limit",
        };
        f.write_str(s)
    }
}

/// Pass/fail plus a score in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub passed: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,
}

/// Immutable record of one sample's evaluation. Created once by the solver
/// engine, owned by the run that produced it, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Stable id: `{run_id}/{sample_id}`.
    pub id: String,
    pub sample_id: String,
    /// Submission order within the run; persisted order follows this.
    pub sample_index: usize,
    /// Input, target, and metadata for the sample.
    pub context: HashMap<String, serde_json::Value>,
    /// Ordered, timestamped model/tool events.
    pub traces: Vec<TraceEvent>,
    pub action: Action,
    pub outcome: Outcome,
    pub created_at: String,
}

impl Episode {
    pub fn new(
        run_id: &str,
        sample_id: &str,
        sample_index: usize,
        context: HashMap<String, serde_json::Value>,
        traces: Vec<TraceEvent>,
        action: Action,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: format!("{}/{}", run_id, sample_id),
            sample_id: sample_id.to_string(),
            sample_index,
            context,
            traces,
            action,
            outcome,
            created_at: now_timestamp(),
        }
    }

    /// True when any trace entry carries the given kind.
    pub fn has_trace(&self, kind: TraceKind) -> bool {
        self.traces.iter().any(|t| t.kind == kind)
    }
}
