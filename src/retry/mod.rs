//! Bounded retry with exponential backoff, gated by the per-site
//! circuit breaker.
//!
//! Backoff sleeps suspend only the calling task; concurrent fetches keep
//! running. When the breaker is Open the wrapped operation is never
//! invoked, so an isolated site costs neither network nor browser time.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitState, SiteHealth};

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::SitePolicy;
use crate::error::EngineError;

/// Retry schedule: `base_delay × backoff^(attempt-1)`, capped at
/// `max_delay`, with optional jitter to spread traffic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff: 1.5,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Schedule carrying the site's configured attempt count.
    pub fn for_site(policy: &SitePolicy) -> Self {
        Self {
            max_attempts: policy.retry_count.max(1),
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self.base_delay.mul_f64(exp).min(self.max_delay);
        if self.jitter {
            delay = delay.mul_f64(0.5 + rand::random::<f64>());
        }
        delay
    }
}

/// Run `op` under the retry schedule with the site's circuit consulted
/// before every attempt.
///
/// An Open circuit fails the call immediately with `CircuitOpen`; no
/// attempt is made, including mid-schedule if the breaker trips while
/// this call is backing off. Success closes the circuit; exhausting the
/// schedule returns `RetriesExhausted` wrapping the last cause.
pub async fn execute<T, F, Fut>(
    site: &str,
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut last_cause: Option<EngineError> = None;

    for attempt in 1..=policy.max_attempts {
        breaker.check(site)?;

        match op(attempt).await {
            Ok(value) => {
                breaker.record_success(site);
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() {
                    // Pool accounting errors say nothing about site
                    // health; surface them without charging the
                    // breaker, and hand back any probe slot this call
                    // was holding so the site can still recover.
                    breaker.release_probe(site);
                    return Err(err);
                }
                breaker.record_failure(site, &err.to_string());
                if attempt < policy.max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        site,
                        attempt,
                        max = policy.max_attempts,
                        ?delay,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_cause = Some(err);
            }
        }
    }

    let source = last_cause.unwrap_or_else(|| {
        // max_attempts >= 1, so the loop always records a cause first.
        EngineError::Transient("retry loop exhausted without a recorded cause".to_string())
    });
    Err(EngineError::RetriesExhausted {
        attempts: policy.max_attempts,
        source: Box::new(source),
    })
}

/// Retry without circuit gating; used for worker startup, where failures
/// are local resource hiccups rather than site health signals.
pub async fn retry_only<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut last_cause: Option<EngineError> = None;

    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                last_cause = Some(err);
            }
        }
    }

    let source = last_cause.unwrap_or_else(|| {
        EngineError::Transient("retry loop exhausted without a recorded cause".to_string())
    });
    Err(EngineError::RetriesExhausted {
        attempts: policy.max_attempts,
        source: Box::new(source),
    })
}
