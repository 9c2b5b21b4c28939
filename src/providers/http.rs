//! OpenAI-compatible HTTP provider.
//!
//! Talks to any endpoint implementing the OpenAI chat completions format
//! (OpenRouter, OpenAI, Anthropic's compat endpoint, Groq, vLLM, local
//! servers). Transient failures are retried with exponential backoff before
//! the gateway ever sees them; rate-limit responses stretch the backoff to
//! honor Retry-After.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use tracing::{debug, warn};

use super::base::{ModelProvider, ModelReply};
use crate::config::schema::ProviderConfig;
use crate::errors::ProviderError;

/// Standard backoff for cloud providers: 1s → 2s → 4s capped at 30s, 3 retries, with jitter.
fn provider_backoff() -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_factor(2.0)
        .with_jitter()
        .with_max_times(3)
}

/// If the error is `RateLimited`, ensure the delay is at least `retry_after_ms`.
///
/// Signature matches `backon::Retry::adjust`: returning `None` aborts the retry.
fn adjust_for_rate_limit(err: &ProviderError, dur: Option<Duration>) -> Option<Duration> {
    match (err, dur) {
        (ProviderError::RateLimited { retry_after_ms, .. }, Some(d)) => {
            Some(d.max(Duration::from_millis(*retry_after_ms)))
        }
        (_, dur) => dur,
    }
}

/// Only network-level and server-side failures are worth retrying here;
/// auth and parse errors will not improve on a second attempt.
fn is_transient(err: &ProviderError) -> bool {
    matches!(
        err,
        ProviderError::HttpError(_)
            | ProviderError::ServerError { .. }
            | ProviderError::RateLimited { .. }
    )
}

/// A model provider that talks to an OpenAI-compatible chat completions endpoint.
pub struct HttpProvider {
    id: String,
    api_key: String,
    api_base: String,
    client: Client,
}

impl HttpProvider {
    pub fn new(id: &str, config: &ProviderConfig) -> Self {
        Self {
            id: id.to_string(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    async fn send_once(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ModelReply, ProviderError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited {
                status: status.as_u16(),
                retry_after_ms,
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::AuthError {
                status: status.as_u16(),
                message,
            });
        }
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        let raw = response
            .text()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::JsonParseError(format!("{}: {}", e, truncate(&raw, 200))))?;

        let text = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "no choices[0].message.content in {}",
                    truncate(&raw, 200)
                ))
            })?
            .to_string();

        let mut usage = HashMap::new();
        if let Some(obj) = parsed["usage"].as_object() {
            for (k, v) in obj {
                if let Some(n) = v.as_i64() {
                    usage.insert(k.clone(), n);
                }
            }
        }

        Ok(ModelReply { text, usage })
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ModelReply> {
        debug!("provider {} call: model={}", self.id, model);
        let reply = (|| self.send_once(model, prompt, max_tokens, temperature))
            .retry(provider_backoff())
            .when(is_transient)
            .adjust(adjust_for_rate_limit)
            .notify(|err, dur| {
                warn!(
                    "provider {} transient failure, retrying in {:?}: {}",
                    self.id, dur, err
                );
            })
            .await?;
        Ok(reply)
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
