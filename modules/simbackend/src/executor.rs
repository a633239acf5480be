//! Deterministic executor backed by a [`SimWorld`].
//!
//! Every (parameters, example) pair hashes to its own random stream, so the
//! same genome gets the same answers on the same examples across runs.
//! Transient failures are drawn per attempt, so a retry of the same pair can
//! succeed.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use genetune_common::{Genome, GenomeParams, GoldenExample};
use genetune_evolve::{ExecutionOutcome, Executor, ExecutorError};

use crate::world::SimWorld;

pub struct SimulatedExecutor {
    world: Arc<SimWorld>,
    salt: u64,
    /// Calls made so far per (parameters, example) stream.
    attempts: Mutex<HashMap<u64, u64>>,
}

impl SimulatedExecutor {
    pub fn new(world: SimWorld) -> Self {
        Self {
            world: Arc::new(world),
            salt: 0,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Different salts give independent draws for the same genome and example.
    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    fn stream_seed(&self, params: &GenomeParams, example: &GoldenExample) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.salt.hash(&mut hasher);
        params.temperature.to_bits().hash(&mut hasher);
        params.top_p.to_bits().hash(&mut hasher);
        params.model_key.hash(&mut hasher);
        params.prompt_variant_id.hash(&mut hasher);
        params.use_chain_of_thought.hash(&mut hasher);
        params.max_tokens.hash(&mut hasher);
        example.id.hash(&mut hasher);
        hasher.finish()
    }

    /// Zero on the first call for a stream, then one more per retry.
    fn next_attempt(&self, stream: u64) -> u64 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = attempts.entry(stream).or_insert(0);
        let attempt = *counter;
        *counter += 1;
        attempt
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(
        &self,
        genome: &Genome,
        example: &GoldenExample,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let params = genome.params();
        let Some(response) = self.world.respond(params) else {
            return Err(ExecutorError::Content(format!(
                "model {} is not served by world {}",
                params.model_key, self.world.name
            )));
        };

        let stream = self.stream_seed(params, example);
        let attempt = self.next_attempt(stream);
        let mix = (attempt + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut outage = StdRng::seed_from_u64(stream ^ mix);
        if outage.random_bool(self.world.transient_failure_rate.clamp(0.0, 1.0)) {
            debug!(
                genome_id = genome.id.as_str(),
                example_id = example.id.as_str(),
                attempt,
                "Simulated rate limit"
            );
            return Err(ExecutorError::Transient("simulated rate limit".into()));
        }
        if response.latency_ms > timeout.as_millis() as u64 {
            return Err(ExecutorError::Transient(format!(
                "simulated call took {}ms, over the {}ms limit",
                response.latency_ms,
                timeout.as_millis()
            )));
        }

        let mut rng = StdRng::seed_from_u64(stream);
        let correct = rng.random_bool(response.accuracy);
        let malformed = rng.random_bool(self.world.malformed_rate.clamp(0.0, 1.0));
        let output = if correct {
            example.expected.clone()
        } else {
            format!("unrelated answer to {}", example.id)
        };
        debug!(
            genome_id = genome.id.as_str(),
            example_id = example.id.as_str(),
            correct,
            "Simulated call"
        );

        Ok(ExecutionOutcome {
            output,
            correctness: if correct { 1.0 } else { 0.0 },
            latency_ms: response.latency_ms,
            tokens_used: response.tokens_used,
            repaired: response.truncated || malformed,
            cost: response.cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genetune_evolve::{execute_with_retry, CallOutcome, RetryPolicy};

    fn genome(model: &str) -> Genome {
        Genome::new(
            GenomeParams {
                temperature: 0.6,
                top_p: 0.9,
                model_key: model.into(),
                prompt_variant_id: "baseline".into(),
                use_chain_of_thought: false,
                max_tokens: 1024,
            },
            0,
        )
    }

    fn example(id: &str) -> GoldenExample {
        GoldenExample {
            id: id.into(),
            input: "What is the capital of France?".into(),
            expected: "Paris".into(),
            category: "geography".into(),
        }
    }

    fn reliable() -> SimWorld {
        SimWorld {
            transient_failure_rate: 0.0,
            ..SimWorld::default()
        }
    }

    #[tokio::test]
    async fn same_inputs_give_same_outcome() {
        let executor = SimulatedExecutor::new(reliable());
        let g = genome("balanced");
        let a = executor.execute(&g, &example("q1"), Duration::from_secs(30)).await.unwrap();
        let b = executor.execute(&g, &example("q1"), Duration::from_secs(30)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn transient_failures_clear_on_retry() {
        let flaky = SimulatedExecutor::new(SimWorld {
            transient_failure_rate: 0.3,
            ..SimWorld::default()
        });
        let steady = SimulatedExecutor::new(reliable());
        let g = genome("balanced");
        let timeout = Duration::from_secs(30);

        let mut failed_first = 0;
        for i in 0..200 {
            let ex = example(&format!("q{i}"));
            if flaky.execute(&g, &ex, timeout).await.is_ok() {
                continue;
            }
            failed_first += 1;
            let mut recovered = None;
            for _ in 0..30 {
                if let Ok(outcome) = flaky.execute(&g, &ex, timeout).await {
                    recovered = Some(outcome);
                    break;
                }
            }
            let recovered = recovered.expect("a retry eventually succeeds");
            // The answer itself does not depend on how many attempts it took.
            let expected = steady.execute(&g, &ex, timeout).await.unwrap();
            assert_eq!(recovered, expected);
        }
        assert!(failed_first > 0);
    }

    #[tokio::test]
    async fn retry_policy_recovers_simulated_rate_limits() {
        let executor = SimulatedExecutor::new(SimWorld {
            transient_failure_rate: 0.3,
            ..SimWorld::default()
        });
        let policy = RetryPolicy {
            max_retries: 30,
            backoff_base: Duration::ZERO,
            backoff_jitter: Duration::ZERO,
            call_timeout: Duration::from_secs(30),
        };
        let g = genome("fast");

        let mut retried = 0;
        for i in 0..100 {
            match execute_with_retry(&executor, &g, &example(&format!("q{i}")), &policy).await {
                CallOutcome::Completed { attempts, .. } => {
                    if attempts > 1 {
                        retried += 1;
                    }
                }
                other => panic!("call did not recover: {other:?}"),
            }
        }
        assert!(retried > 0);
    }

    #[tokio::test]
    async fn unknown_model_is_a_content_error() {
        let executor = SimulatedExecutor::new(SimWorld::default());
        let result = executor
            .execute(&genome("retired"), &example("q1"), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(ExecutorError::Content(_))));
    }

    #[tokio::test]
    async fn slow_calls_exceed_the_timeout() {
        let executor = SimulatedExecutor::new(reliable());
        let result = executor
            .execute(&genome("large"), &example("q1"), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(ExecutorError::Transient(_))));
    }

    #[tokio::test]
    async fn always_failing_world() {
        let world = SimWorld {
            transient_failure_rate: 1.0,
            ..SimWorld::default()
        };
        let executor = SimulatedExecutor::new(world);
        let result = executor
            .execute(&genome("fast"), &example("q1"), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(ExecutorError::Transient(_))));
    }
}
