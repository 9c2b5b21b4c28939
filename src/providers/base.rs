//! Base model provider interface.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Response from a model provider.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    /// Token usage counters as reported by the provider (may be empty).
    pub usage: HashMap<String, i64>,
}

/// Abstract base trait for model providers.
///
/// Implementations handle the specifics of each provider's API while
/// maintaining a consistent interface. Errors embed [`crate::errors::
/// ProviderError`] inside `anyhow::Error` for downcasting.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send a single-prompt completion request.
    ///
    /// # Arguments
    /// * `model` - Model identifier (provider-specific, no provider prefix).
    /// * `prompt` - The user prompt.
    /// * `max_tokens` - Maximum tokens in the response.
    /// * `temperature` - Sampling temperature.
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ModelReply>;

    /// Stable provider id used for rate-limit accounting.
    fn provider_id(&self) -> &str;
}
