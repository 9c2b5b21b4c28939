//! Configuration schema for evalbot.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so that the JSON config
//! file can use camelCase keys while Rust code uses snake_case fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provider configs
// ---------------------------------------------------------------------------

/// One model provider endpoint plus its rate budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    /// OpenAI-compatible chat completions base URL.
    #[serde(default)]
    pub api_base: String,
    /// Maximum tokens in the bucket.
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: f64,
    /// Bucket refill rate in tokens per second.
    #[serde(default = "default_rate_refill")]
    pub rate_refill_per_sec: f64,
}

fn default_rate_capacity() -> f64 {
    10.0
}

fn default_rate_refill() -> f64 {
    2.0
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: String::new(),
            rate_capacity: default_rate_capacity(),
            rate_refill_per_sec: default_rate_refill(),
        }
    }
}

/// Provider registry: provider id -> endpoint config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    /// Provider used for model ids without a `provider/` prefix.
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub endpoints: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            endpoints: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run configs
// ---------------------------------------------------------------------------

/// One logical model slot: a primary model and its fallbacks, tried in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSlot {
    pub model: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

/// Solver execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Concurrent samples evaluated at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_samples: usize,
    /// Bound on one model call, including the blocking token acquire.
    #[serde(default = "default_ask_timeout")]
    pub ask_timeout_secs: u64,
    /// Deadline for one sample's solver invocation.
    #[serde(default = "default_sample_deadline")]
    pub sample_deadline_secs: u64,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_ask_timeout() -> u64 {
    60
}

fn default_sample_deadline() -> u64 {
    120
}

fn default_max_response_tokens() -> u32 {
    1024
}

fn default_temperature() -> f64 {
    0.0
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel_samples: default_max_parallel(),
            ask_timeout_secs: default_ask_timeout(),
            sample_deadline_secs: default_sample_deadline(),
            max_response_tokens: default_max_response_tokens(),
            temperature: default_temperature(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats / learning configs
// ---------------------------------------------------------------------------

/// Statistical comparison settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsConfig {
    /// Two-sided confidence level for Wilson intervals.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.95
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
        }
    }
}

/// Lesson extraction and retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningConfig {
    /// A failure mode must exceed this share of a run's failures before a
    /// lesson is extracted from it.
    #[serde(default = "default_min_failure_proportion")]
    pub min_failure_proportion: f64,
    /// Approved lessons unused for this long are archived (reversible).
    #[serde(default = "default_max_idle_days")]
    pub max_idle_days: i64,
    #[serde(default = "default_max_retrieved")]
    pub max_retrieved: usize,
}

fn default_min_failure_proportion() -> f64 {
    0.2
}

fn default_max_idle_days() -> i64 {
    30
}

fn default_max_retrieved() -> usize {
    5
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_failure_proportion: default_min_failure_proportion(),
            max_idle_days: default_max_idle_days(),
            max_retrieved: default_max_retrieved(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level evalbot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    /// Data directory override. Defaults to `~/.evalbot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}
