//! Retry with exponential backoff plus a circuit breaker around store calls.
//!
//! Only transient store errors (`StoreError::Unavailable`) are retried and counted
//! against the breaker. After `failure_threshold` consecutive transient failures the
//! breaker opens and calls fail fast with `EngineError::CircuitOpen` until the
//! cooldown expires; the next call after that is a trial (half-open).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::error::{EngineError, EngineResult, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Total attempts per call, including the first.
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub breaker_failures: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_ms: 100,
            retry_max_ms: 2_000,
            breaker_failures: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: ChronoDuration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown: ChronoDuration::milliseconds(cooldown_ms as i64),
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// `Err(retry_in_ms)` while open.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), u64> {
        let st = self.state.lock().expect("breaker mutex poisoned");
        match st.opened_at {
            Some(at) if now - at < self.cooldown => {
                let left = (self.cooldown - (now - at)).num_milliseconds().max(0) as u64;
                Err(left)
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut st = self.state.lock().expect("breaker mutex poisoned");
        st.consecutive_failures = 0;
        st.opened_at = None;
    }

    /// Returns true when this failure opened (or re-opened) the breaker.
    pub fn record_failure(&self, now: DateTime<Utc>) -> bool {
        let mut st = self.state.lock().expect("breaker mutex poisoned");
        st.consecutive_failures += 1;
        if st.consecutive_failures >= self.failure_threshold {
            st.opened_at = Some(now);
            return true;
        }
        false
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_err()
    }
}

/// Wraps every store call made by the engine.
#[derive(Debug)]
pub struct StoreGuard {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl StoreGuard {
    pub fn new(cfg: &ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: cfg.retry_attempts.max(1),
                base_delay: Duration::from_millis(cfg.retry_base_ms),
                max_delay: Duration::from_millis(cfg.retry_max_ms.max(cfg.retry_base_ms)),
            },
            breaker: CircuitBreaker::new(cfg.breaker_failures, cfg.breaker_cooldown_ms),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            if let Err(retry_in_ms) = self.breaker.check(Utc::now()) {
                counter!("spam_circuit_rejections_total").increment(1);
                return Err(EngineError::CircuitOpen { retry_in_ms });
            }

            match call().await {
                Ok(v) => {
                    self.breaker.record_success();
                    return Ok(v);
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if self.breaker.record_failure(Utc::now()) {
                        counter!("spam_circuit_open_total").increment(1);
                        warn!(target: "spam", op, error = %e, "store circuit opened");
                        return Err(e.into());
                    }
                    if attempt >= self.retry.max_attempts {
                        warn!(target: "spam", op, attempt, error = %e, "store call failed, retries exhausted");
                        return Err(e.into());
                    }
                    let delay = self.retry.delay_for(attempt);
                    counter!("spam_store_retries_total").increment(1);
                    warn!(
                        target: "spam",
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
