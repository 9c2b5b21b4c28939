//! Domain error types for evalbot.
//!
//! Typed errors at module boundaries replace string-encoded errors and
//! enable structured error handling via pattern matching.

use thiserror::Error;

use crate::run::state::Phase;

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Errors from model provider operations.
///
/// Embedded in `anyhow::Error` so the `ModelProvider` trait signature
/// (`-> anyhow::Result<ModelReply>`) stays unchanged while callers
/// can downcast: `e.downcast_ref::<ProviderError>()`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Failed to parse response JSON: {0}")]
    JsonParseError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Rate limited (status {status}): retry after {retry_after_ms}ms")]
    RateLimited { status: u16, retry_after_ms: u64 },

    #[error("Authentication failed (status {status}): {message}")]
    AuthError { status: u16, message: String },

    #[error("Server error (status {status}): {message}")]
    ServerError { status: u16, message: String },
}

// ---------------------------------------------------------------------------
// Rate limiter errors
// ---------------------------------------------------------------------------

/// Errors from token-bucket admission control.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Non-blocking acquire found no token; `wait_ms` is the time until
    /// the next token becomes available at the current refill rate.
    #[error("rate budget exhausted for {provider}: next token in {wait_ms}ms")]
    Exhausted { provider: String, wait_ms: u64 },

    /// Blocking acquire could not obtain a token within its timeout.
    #[error("timed out after {waited_ms}ms waiting for a {provider} token")]
    Timeout { provider: String, waited_ms: u64 },
}

// ---------------------------------------------------------------------------
// Gateway errors
// ---------------------------------------------------------------------------

/// One failed attempt against a fallback-chain entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAttempt {
    pub model: String,
    pub error: String,
}

/// Errors from the model gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Every entry in the fallback chain failed. Carries the ordered list
    /// of attempts so callers can see exactly what was tried.
    #[error("all models failed after {} attempts: {}", .attempts.len(), summarize_attempts(.attempts))]
    AllModelsFailed { attempts: Vec<ModelAttempt> },
}

fn summarize_attempts(attempts: &[ModelAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.model, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Bad run configuration, surfaced during SETUP before a run starts.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("benchmark id is empty")]
    EmptyBenchmark,

    #[error("unknown solver: {0}")]
    UnknownSolver(String),

    #[error("model configuration has no slots")]
    EmptyModelConfig,

    #[error("invalid fallback chain: {0}")]
    InvalidChain(String),

    #[error("run has no samples")]
    NoSamples,

    #[error("custom solver manifest not loadable: {0}")]
    BadSolverManifest(String),
}

// ---------------------------------------------------------------------------
// State machine errors
// ---------------------------------------------------------------------------

/// Illegal run-lifecycle operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

// ---------------------------------------------------------------------------
// Persistence errors
// ---------------------------------------------------------------------------

/// Durable-store failures. Fatal to the current run: the state machine
/// forces the phase back to IDLE, already-written episodes remain intact.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl StoreError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics errors
// ---------------------------------------------------------------------------

/// Errors from the statistical comparison engine. Callers treat these as
/// "comparison unavailable", never as a crash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("runs share no paired sample ids")]
    InsufficientPairedSamples,
}
