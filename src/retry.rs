//! Retry executor with exponential backoff.
//!
//! Wraps one logical provider operation. Every failure is classified; only
//! `transient`, `rate_limited` and `unknown` failures are retried, and the
//! delay before the retry that follows attempt `k` is
//! `min(backoff_base_ms * 2^(k-1), backoff_max_ms)` for every retryable kind.
//! Sleeps go through the [`Clock`] and stop early on cancellation.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::SyncFailure;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::providers::ProviderError;

/// Per-integration retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retry_enabled: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            retry_enabled: config.retry_enabled,
            max_attempts: config.max_attempts,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }

    /// Apply an integration's stored override on top of `self`.
    ///
    /// The override may name any subset of fields; unknown keys and values of
    /// the wrong type are ignored.
    pub fn with_override(self, stored: Option<&JsonValue>) -> Self {
        let Some(JsonValue::Object(fields)) = stored else {
            return self;
        };

        let mut policy = self;
        if let Some(enabled) = fields.get("retry_enabled").and_then(JsonValue::as_bool) {
            policy.retry_enabled = enabled;
        }
        if let Some(attempts) = fields.get("max_attempts").and_then(JsonValue::as_u64) {
            policy.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX).max(1);
        }
        if let Some(base) = fields.get("backoff_base_ms").and_then(JsonValue::as_u64) {
            policy.backoff_base_ms = base;
        }
        if let Some(max) = fields.get("backoff_max_ms").and_then(JsonValue::as_u64) {
            policy.backoff_max_ms = max;
        }
        policy
    }

    /// Attempts the executor will make, counting the first call.
    pub fn effective_attempts(&self) -> u32 {
        if self.retry_enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay_ms)
    }
}

/// A successful operation and the number of calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why the executor gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Last failure, annotated with the total attempt count.
    Failed(SyncFailure),
    /// Cancellation observed at a retry boundary.
    Cancelled { attempts: u32 },
}

/// Runs one operation under a [`RetryPolicy`].
pub struct RetryExecutor<'a> {
    policy: RetryPolicy,
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: RetryPolicy, clock: &'a dyn Clock, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            clock,
            cancel,
        }
    }

    /// Execute `operation`, passing it the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.policy.effective_attempts();
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            let failure = SyncFailure::from_provider_error(&error).with_attempts(attempt);

            if !failure.kind.is_retryable() || attempt >= max_attempts {
                if failure.kind.is_retryable() {
                    warn!(attempts = attempt, kind = %failure.kind, error = %error, "Retries exhausted");
                }
                return Err(RetryError::Failed(failure));
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                kind = %failure.kind,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed; retrying"
            );
            counter!("sync_retry_attempts_total", "kind" => failure.kind.as_str()).increment(1);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = self.clock.sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
