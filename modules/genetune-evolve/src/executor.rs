//! The seam to the LLM backend, plus the retry policy wrapped around it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use genetune_common::{ExecutorConfig, Genome, GoldenExample};

/// What the backend returned for one genome on one example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: String,
    /// Correctness as judged by the backend itself. Only used when grading
    /// mode is `executor`; otherwise `output` is graded against the example.
    pub correctness: f64,
    pub latency_ms: u64,
    pub tokens_used: u32,
    /// Output needed a repair pass (malformed JSON, truncated answer, ...).
    pub repaired: bool,
    pub cost: f64,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Worth retrying: rate limits, timeouts, connection resets.
    #[error("transient executor failure: {0}")]
    Transient(String),

    /// The backend answered but the answer is unusable. Not retried.
    #[error("unusable executor output: {0}")]
    Content(String),
}

/// Runs one genome against one example.
///
/// Implementations must honour `timeout`; the evaluator enforces it as well
/// and treats an overrun as a transient failure.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        genome: &Genome,
        example: &GoldenExample,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn execute(
        &self,
        genome: &Genome,
        example: &GoldenExample,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        (**self).execute(genome, example, timeout).await
    }
}

/// Timeout and retry settings for a single executor call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_jitter: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_jitter: Duration::from_millis(config.backoff_jitter_ms),
            call_timeout: config.call_timeout(),
        }
    }

    /// `base * 3^attempt` plus uniform jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_base * 3u32.saturating_pow(attempt);
        let jitter_ms = self.backoff_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        backoff + jitter
    }
}

/// Final result of a call after retries.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Completed {
        outcome: ExecutionOutcome,
        attempts: u32,
    },
    /// Content failure; recorded as a repaired, zero-correctness answer.
    Rejected {
        reason: String,
        latency_ms: u64,
        attempts: u32,
    },
    /// Every attempt failed transiently.
    Exhausted { error: String, attempts: u32 },
}

/// Call the executor with a per-attempt timeout, retrying transient failures
/// with exponential backoff.
pub async fn execute_with_retry(
    executor: &dyn Executor,
    genome: &Genome,
    example: &GoldenExample,
    policy: &RetryPolicy,
) -> CallOutcome {
    let max_attempts = policy.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        let started = Instant::now();
        let result = tokio::time::timeout(
            policy.call_timeout,
            executor.execute(genome, example, policy.call_timeout),
        )
        .await;

        let error = match result {
            Ok(Ok(outcome)) => {
                return CallOutcome::Completed {
                    outcome,
                    attempts: attempt + 1,
                }
            }
            Ok(Err(ExecutorError::Content(reason))) => {
                return CallOutcome::Rejected {
                    reason,
                    latency_ms: started.elapsed().as_millis() as u64,
                    attempts: attempt + 1,
                }
            }
            Ok(Err(ExecutorError::Transient(e))) => e,
            Err(_) => format!("timed out after {}ms", policy.call_timeout.as_millis()),
        };

        if attempt + 1 < max_attempts {
            let backoff = policy.backoff(attempt);
            warn!(
                genome_id = genome.id.as_str(),
                example_id = example.id.as_str(),
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = error.as_str(),
                "Executor call failed, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
        last_error = error;
    }

    warn!(
        genome_id = genome.id.as_str(),
        example_id = example.id.as_str(),
        attempts = max_attempts,
        error = last_error.as_str(),
        "Executor retries exhausted"
    );
    CallOutcome::Exhausted {
        error: last_error,
        attempts: max_attempts,
    }
}
