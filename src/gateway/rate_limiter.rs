//! Per-provider token-bucket admission control for outbound model calls.
//!
//! Refill is lazy: computed at acquisition time from the elapsed interval,
//! never via a background timer. Each provider has its own bucket behind its
//! own async mutex, so unrelated providers never contend; the outer registry
//! lock is held only long enough to clone the bucket handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::RateLimitError;

/// Per-provider bucket state. `tokens` stays in `[0, capacity]`.
#[derive(Debug)]
struct RateBudget {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl RateBudget {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Lazily credit tokens for the elapsed interval, clamped to capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let wait_secs = (1.0 - self.tokens) / self.refill_rate;
        Err(Duration::from_secs_f64(wait_secs))
    }
}

/// Token-bucket rate limiter keyed by provider id.
pub struct RateLimiter {
    buckets: StdMutex<HashMap<String, Arc<Mutex<RateBudget>>>>,
    default_capacity: f64,
    default_refill_rate: f64,
}

impl RateLimiter {
    /// Create a limiter whose unknown providers get the given default budget.
    pub fn new(default_capacity: f64, default_refill_rate: f64) -> Self {
        Self {
            buckets: StdMutex::new(HashMap::new()),
            default_capacity,
            default_refill_rate,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<RateBudget>>>> {
        match self.buckets.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an explicit budget for a provider, replacing any existing one.
    pub fn set_budget(&self, provider: &str, capacity: f64, refill_rate: f64) {
        self.registry().insert(
            provider.to_string(),
            Arc::new(Mutex::new(RateBudget::new(capacity, refill_rate))),
        );
    }

    /// Clone the bucket handle for a provider, creating it on first use.
    fn bucket(&self, provider: &str) -> Arc<Mutex<RateBudget>> {
        self.registry()
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RateBudget::new(
                    self.default_capacity,
                    self.default_refill_rate,
                )))
            })
            .clone()
    }

    /// Non-blocking acquire: grant immediately or fail with the wait hint.
    pub async fn try_acquire(&self, provider: &str) -> Result<(), RateLimitError> {
        let bucket = self.bucket(provider);
        let mut budget = bucket.lock().await;
        budget
            .take(Instant::now())
            .map_err(|wait| RateLimitError::Exhausted {
                provider: provider.to_string(),
                wait_ms: wait.as_millis() as u64,
            })
    }

    /// Blocking acquire: wait for the computed refill interval and retry once,
    /// bounded by `timeout`.
    pub async fn acquire(&self, provider: &str, timeout: Duration) -> Result<(), RateLimitError> {
        let bucket = self.bucket(provider);
        let started = Instant::now();

        let wait = {
            let mut budget = bucket.lock().await;
            match budget.take(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            }
        };

        if wait > timeout {
            return Err(RateLimitError::Timeout {
                provider: provider.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }

        debug!("rate limit wait for {}: {:?}", provider, wait);
        tokio::time::sleep(wait).await;

        let mut budget = bucket.lock().await;
        budget
            .take(Instant::now())
            .map_err(|_| RateLimitError::Timeout {
                provider: provider.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_grants_instantly() {
        let limiter = RateLimiter::new(3.0, 1.0);
        for _ in 0..3 {
            limiter.try_acquire("openai").await.unwrap();
        }
        // The capacity+1-th within the same instant fails.
        let err = limiter.try_acquire("openai").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_refill_yields_exactly_one_token() {
        // 50 tokens/sec → one token every 20ms.
        let limiter = RateLimiter::new(1.0, 50.0);
        limiter.try_acquire("p").await.unwrap();
        assert!(limiter.try_acquire("p").await.is_err());

        tokio::time::sleep(Duration::from_millis(25)).await;
        limiter.try_acquire("p").await.unwrap();
        // Only one token accrued in that window.
        assert!(limiter.try_acquire("p").await.is_err());
    }

    #[tokio::test]
    async fn test_blocking_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1.0, 50.0);
        limiter.try_acquire("p").await.unwrap();

        let started = Instant::now();
        limiter
            .acquire("p", Duration::from_millis(500))
            .await
            .unwrap();
        // Had to wait roughly one refill interval (20ms at 50/sec).
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_blocking_acquire_times_out() {
        // 0.1 tokens/sec → next token in ~10s, far beyond the timeout.
        let limiter = RateLimiter::new(1.0, 0.1);
        limiter.try_acquire("p").await.unwrap();

        let err = limiter
            .acquire("p", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_providers_have_independent_buckets() {
        let limiter = RateLimiter::new(1.0, 0.1);
        limiter.try_acquire("a").await.unwrap();
        assert!(limiter.try_acquire("a").await.is_err());
        // A different provider is unaffected.
        limiter.try_acquire("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_budget_overrides_default() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.set_budget("big", 5.0, 1.0);
        for _ in 0..5 {
            limiter.try_acquire("big").await.unwrap();
        }
        assert!(limiter.try_acquire("big").await.is_err());
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(2.0, 1000.0);
        // Long idle at a huge refill rate must still clamp at capacity.
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.try_acquire("p").await.unwrap();
        limiter.try_acquire("p").await.unwrap();
        assert!(limiter.try_acquire("p").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_grant_exactly_capacity() {
        let limiter = Arc::new(RateLimiter::new(4.0, 0.001));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.try_acquire("p").await.is_ok() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
    }
}
