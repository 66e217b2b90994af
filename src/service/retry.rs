use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::engine_error::{EngineError, ErrorKind};

/// Exponential schedule for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
    schedule: HashMap<ErrorKind, Backoff>,
    fallback: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let schedule = HashMap::from([
            // Rate limits get the longest ceiling.
            (ErrorKind::RateLimited, Backoff::new(2_000, 30_000)),
            (ErrorKind::ServerError, Backoff::new(1_000, 10_000)),
            (ErrorKind::Timeout, Backoff::new(1_000, 8_000)),
            (ErrorKind::Network, Backoff::new(500, 5_000)),
            (ErrorKind::ResultsPending, Backoff::new(3_000, 20_000)),
            (ErrorKind::ResultsTemporarilyUnavailable, Backoff::new(500, 3_000)),
        ]);
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_multiplier: 2.0,
            jitter_ms: config.jitter_ms,
            schedule,
            fallback: Backoff::new(1_000, 5_000),
        }
    }

    /// Millisecond-scale schedule without jitter, for tests and replays.
    pub fn immediate(max_attempts: u32) -> Self {
        let mut policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts,
            jitter_ms: 0,
        });
        for backoff in policy.schedule.values_mut() {
            *backoff = Backoff::new(1, 2);
        }
        policy.fallback = Backoff::new(1, 2);
        policy
    }

    pub fn with_backoff(mut self, kind: ErrorKind, backoff: Backoff) -> Self {
        self.schedule.insert(kind, backoff);
        self
    }

    pub fn backoff(&self, kind: ErrorKind) -> Backoff {
        self.schedule.get(&kind).copied().unwrap_or(self.fallback)
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let backoff = self.backoff(kind);
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = backoff.base_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(backoff.cap_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    pub fn jittered_delay(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.delay_for(kind, attempt) + Duration::from_millis(jitter)
    }
}

/// Runs an operation under a `RetryPolicy`.
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry transport-level failures (`ErrorKind::is_retryable`).
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, op: F, classify: C) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(E) -> EngineError,
    {
        self.run_if(label, op, classify, |kind| kind.is_retryable())
            .await
    }

    /// Retry whatever `should_retry` accepts, up to `max_attempts` calls in total.
    ///
    /// The surfaced error is the last classified one, annotated with the number
    /// of attempts made and, when the budget ran out, the next scheduled delay.
    pub async fn run_if<T, E, F, Fut, C, P>(
        &self,
        label: &str,
        mut op: F,
        classify: C,
        should_retry: P,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(E) -> EngineError,
        P: Fn(ErrorKind) -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => classify(e),
            };

            if !should_retry(err.kind) {
                debug!(operation = label, kind = %err.kind, "Not retrying");
                return Err(err.with_attempts(attempt));
            }

            if attempt >= self.policy.max_attempts {
                let next = self.policy.delay_for(err.kind, attempt);
                error!(
                    operation = label,
                    attempts = attempt,
                    kind = %err.kind,
                    error = %err.message,
                    "Retry limit exceeded"
                );
                return Err(err.with_attempts(attempt).with_retry_after(next));
            }

            let delay = self.policy.jittered_delay(err.kind, attempt);
            warn!(
                operation = label,
                attempt = attempt,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
