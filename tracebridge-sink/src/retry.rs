//! Sink Retry
//!
//! Every logical sink operation is retried independently with exponential
//! backoff, jitter, and a fixed attempt budget. After exhaustion the
//! failure is logged with the operation name and surfaced as
//! [`SinkError::Exhausted`]; callers decide whether to swallow it.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::{GenerationRecord, SinkError, SpanRecord, TraceRecord, TraceSink};

/// Backoff parameters for sink operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap for any single inter-attempt delay.
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Jitter fraction applied to each delay (0.1 means ±5%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based: `retry` 1 follows the first
    /// failed attempt). Doubles per retry, capped, then jittered.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let unjittered = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return unjittered;
        }
        let factor = 1.0 + self.jitter * (rand::random::<f64>() - 0.5);
        unjittered.mul_f64(factor).max(self.base_delay)
    }

    /// Run `operation` under this policy.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Sink operation failed, retry budget exhausted"
                    );
                    return Err(SinkError::Exhausted {
                        operation,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sink operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A [`TraceSink`] wrapper that applies a [`RetryPolicy`] to every
/// operation of the inner sink.
pub struct RetryingSink<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingSink<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait::async_trait]
impl<S: TraceSink> TraceSink for RetryingSink<S> {
    async fn create_trace(&self, record: TraceRecord) -> Result<(), SinkError> {
        self.policy
            .run("create_trace", || self.inner.create_trace(record.clone()))
            .await
    }

    async fn create_generation(&self, record: GenerationRecord) -> Result<(), SinkError> {
        self.policy
            .run("create_generation", || {
                self.inner.create_generation(record.clone())
            })
            .await
    }

    async fn create_span(&self, record: SpanRecord) -> Result<(), SinkError> {
        self.policy
            .run("create_span", || self.inner.create_span(record.clone()))
            .await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.policy.run("flush", || self.inner.flush()).await
    }

    async fn shutdown(&self) -> Result<(), SinkError> {
        self.policy.run("shutdown", || self.inner.shutdown()).await
    }
}
