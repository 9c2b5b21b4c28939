//! Model gateway: one logical "ask" with fallback-chain retry.
//!
//! Every attempt, success or failure, consumes a rate-limiter token for the
//! model's provider. A rate-limit timeout counts as an attempt against the
//! current chain entry before falling back. Exhausting the chain yields
//! `AllModelsFailed` carrying every (model, error) pair tried; the gateway
//! never fabricates an empty answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::schema::ModelSlot;
use crate::errors::{GatewayError, ModelAttempt, ValidationError};
use crate::gateway::rate_limiter::RateLimiter;
use crate::providers::base::ModelProvider;

/// Ordered model ids for one logical model slot: primary first, then
/// fallbacks. Non-empty and duplicate-free by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    models: Vec<String>,
}

impl FallbackChain {
    pub fn new(models: Vec<String>) -> Result<Self, ValidationError> {
        if models.is_empty() {
            return Err(ValidationError::InvalidChain("chain is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for m in &models {
            if m.trim().is_empty() {
                return Err(ValidationError::InvalidChain("blank model id".into()));
            }
            if !seen.insert(m.as_str()) {
                return Err(ValidationError::InvalidChain(format!(
                    "duplicate model id: {}",
                    m
                )));
            }
        }
        Ok(Self { models })
    }

    /// Build from a config slot: primary model followed by its fallbacks.
    pub fn from_slot(slot: &ModelSlot) -> Result<Self, ValidationError> {
        let mut models = vec![slot.model.clone()];
        models.extend(slot.fallback.iter().cloned());
        Self::new(models)
    }

    pub fn primary(&self) -> &str {
        &self.models[0]
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }
}

/// A successful gateway answer: which model actually produced it, plus the
/// failures recorded on the way there.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub model: String,
    pub text: String,
    pub latency_ms: u64,
    /// Chain entries that failed before this answer was produced.
    pub failed_attempts: Vec<ModelAttempt>,
}

/// Issues logical model requests through the provider registry with
/// per-provider rate limiting and fallback.
pub struct ModelGateway {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    limiter: Arc<RateLimiter>,
    default_provider: String,
    call_timeout: Duration,
    max_tokens: u32,
    temperature: f64,
}

impl ModelGateway {
    pub fn new(
        providers: HashMap<String, Arc<dyn ModelProvider>>,
        limiter: Arc<RateLimiter>,
        default_provider: &str,
        call_timeout: Duration,
        max_tokens: u32,
        temperature: f64,
    ) -> Self {
        Self {
            providers,
            limiter,
            default_provider: default_provider.to_string(),
            call_timeout,
            max_tokens,
            temperature,
        }
    }

    /// Split a `provider/model` id; bare ids use the default provider.
    fn split_model_id<'a>(&'a self, model: &'a str) -> (&'a str, &'a str) {
        match model.split_once('/') {
            Some((provider, bare)) => (provider, bare),
            None => (self.default_provider.as_str(), model),
        }
    }

    /// Ask the chain's primary model, falling back in order until one entry
    /// produces a non-empty answer.
    pub async fn ask(
        &self,
        chain: &FallbackChain,
        prompt: &str,
    ) -> Result<GatewayReply, GatewayError> {
        let mut attempts: Vec<ModelAttempt> = Vec::new();

        for model in chain.models() {
            let (provider_id, bare_model) = self.split_model_id(model);

            if let Err(e) = self.limiter.acquire(provider_id, self.call_timeout).await {
                warn!("rate limit attempt failed for {}: {}", model, e);
                attempts.push(ModelAttempt {
                    model: model.clone(),
                    error: e.to_string(),
                });
                continue;
            }

            let provider = match self.providers.get(provider_id) {
                Some(p) => p,
                None => {
                    attempts.push(ModelAttempt {
                        model: model.clone(),
                        error: format!("no provider configured: {}", provider_id),
                    });
                    continue;
                }
            };

            let started = Instant::now();
            let call = provider.complete(bare_model, prompt, self.max_tokens, self.temperature);
            match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(reply)) if !reply.text.trim().is_empty() => {
                    debug!(
                        "gateway answer from {} in {}ms",
                        model,
                        started.elapsed().as_millis()
                    );
                    return Ok(GatewayReply {
                        model: model.clone(),
                        text: reply.text,
                        latency_ms: started.elapsed().as_millis() as u64,
                        failed_attempts: attempts,
                    });
                }
                Ok(Ok(_)) => {
                    attempts.push(ModelAttempt {
                        model: model.clone(),
                        error: "empty response".into(),
                    });
                }
                Ok(Err(e)) => {
                    attempts.push(ModelAttempt {
                        model: model.clone(),
                        error: e.to_string(),
                    });
                }
                Err(_) => {
                    attempts.push(ModelAttempt {
                        model: model.clone(),
                        error: format!("call timed out after {:?}", self.call_timeout),
                    });
                }
            }
            warn!("model {} failed, advancing fallback chain", model);
        }

        Err(GatewayError::AllModelsFailed { attempts })
    }
}
