//! Fitness evaluation: fans (genome × example) calls out to the executor and
//! folds the results into a [`FitnessScore`].
//!
//! Formula:
//! - `total = mean(correctness) − latency·mean(latency_ms) − tokens·mean(tokens_used)
//!   − repairs·repair_rate − cost·mean(cost)`
//!
//! Exhausted retries are recorded as a maximum-penalty result so a flaky genome
//! can never look better than one that answered.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::seq::index;
use rand::Rng;
use tracing::debug;

use genetune_common::{
    EvaluationResult, ExecutorConfig, FitnessScore, FitnessWeights, Genome, GoldenExample,
};

use crate::executor::{execute_with_retry, CallOutcome, Executor, RetryPolicy};
use crate::grade::{grader_for, Grader};

/// The examples every genome of a generation is scored against.
///
/// Scores are only comparable within one epoch; a new epoch means a new subset.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleSubset {
    pub epoch: u32,
    examples: Vec<GoldenExample>,
}

impl ExampleSubset {
    /// Draw `size` distinct examples, kept in dataset order.
    pub fn sample<R: Rng>(dataset: &[GoldenExample], size: usize, epoch: u32, rng: &mut R) -> Self {
        let amount = size.min(dataset.len());
        let mut picks = index::sample(rng, dataset.len(), amount).into_vec();
        picks.sort_unstable();
        Self {
            epoch,
            examples: picks.into_iter().map(|i| dataset[i].clone()).collect(),
        }
    }

    /// Use the whole dataset as-is.
    pub fn full(dataset: &[GoldenExample], epoch: u32) -> Self {
        Self {
            epoch,
            examples: dataset.to_vec(),
        }
    }

    pub fn examples(&self) -> &[GoldenExample] {
        &self.examples
    }

    pub fn ids(&self) -> Vec<String> {
        self.examples.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

#[derive(Clone)]
pub struct FitnessEvaluator {
    weights: FitnessWeights,
    retry: RetryPolicy,
    max_in_flight: usize,
    failure_cost: f64,
    /// `None` trusts the executor's own correctness.
    grader: Option<Arc<dyn Grader>>,
}

impl FitnessEvaluator {
    pub fn new(config: &ExecutorConfig, weights: FitnessWeights) -> Self {
        Self {
            weights,
            retry: RetryPolicy::from_config(config),
            max_in_flight: config.max_in_flight.max(1),
            failure_cost: config.failure_cost,
            grader: grader_for(config.grading),
        }
    }

    /// Plug in an external grader (rubric, model-graded, ...).
    pub fn with_grader(mut self, grader: Arc<dyn Grader>) -> Self {
        self.grader = Some(grader);
        self
    }

    pub fn weights(&self) -> &FitnessWeights {
        &self.weights
    }

    /// Evaluate one genome on every example of the subset.
    pub async fn evaluate(
        &self,
        genome: &Genome,
        subset: &ExampleSubset,
        executor: &dyn Executor,
    ) -> Vec<EvaluationResult> {
        self.evaluate_population(std::slice::from_ref(genome), subset, executor)
            .await
            .pop()
            .unwrap_or_default()
    }

    /// Evaluate the (genome × example) cross-product with at most
    /// `max_in_flight` calls outstanding. Returns one result list per genome,
    /// in input order, each in subset order.
    pub async fn evaluate_population(
        &self,
        genomes: &[Genome],
        subset: &ExampleSubset,
        executor: &dyn Executor,
    ) -> Vec<Vec<EvaluationResult>> {
        let calls = genomes.iter().enumerate().flat_map(|(gi, genome)| {
            subset
                .examples()
                .iter()
                .enumerate()
                .map(move |(ei, example)| (gi, ei, genome, example))
        });

        let finished: Vec<(usize, usize, EvaluationResult)> = stream::iter(calls)
            .map(|(gi, ei, genome, example)| async move {
                let call = execute_with_retry(executor, genome, example, &self.retry).await;
                (gi, ei, self.to_result(genome, example, call).await)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        let mut slots: Vec<Vec<Option<EvaluationResult>>> =
            vec![vec![None; subset.len()]; genomes.len()];
        for (gi, ei, result) in finished {
            slots[gi][ei] = Some(result);
        }
        slots
            .into_iter()
            .map(|row| row.into_iter().flatten().collect())
            .collect()
    }

    /// Fold per-example results into a score for `epoch`.
    pub fn score(&self, results: &[EvaluationResult], epoch: u32) -> FitnessScore {
        score(results, &self.weights, epoch)
    }

    async fn to_result(
        &self,
        genome: &Genome,
        example: &GoldenExample,
        call: CallOutcome,
    ) -> EvaluationResult {
        let base = EvaluationResult {
            genome_id: genome.id.clone(),
            example_id: example.id.clone(),
            correctness: 0.0,
            latency_ms: 0,
            tokens_used: 0,
            repaired: false,
            cost: 0.0,
            failed: false,
        };

        match call {
            CallOutcome::Completed { outcome, .. } => {
                let correctness = match &self.grader {
                    Some(grader) => grader.grade(&outcome.output, &example.expected).await,
                    None => outcome.correctness,
                };
                EvaluationResult {
                    correctness: unit_interval(correctness),
                    latency_ms: outcome.latency_ms,
                    tokens_used: outcome.tokens_used,
                    repaired: outcome.repaired,
                    cost: outcome.cost,
                    ..base
                }
            }
            CallOutcome::Rejected {
                reason, latency_ms, ..
            } => {
                debug!(
                    genome_id = genome.id.as_str(),
                    example_id = example.id.as_str(),
                    reason = reason.as_str(),
                    "Unusable output counted as a repair"
                );
                EvaluationResult {
                    latency_ms,
                    repaired: true,
                    ..base
                }
            }
            CallOutcome::Exhausted { .. } => EvaluationResult {
                latency_ms: self.retry.call_timeout.as_millis() as u64,
                tokens_used: genome.params().max_tokens,
                repaired: true,
                cost: self.failure_cost,
                failed: true,
                ..base
            },
        }
    }
}

/// Weighted scalar fitness over one genome's results. Higher is better.
pub fn score(results: &[EvaluationResult], weights: &FitnessWeights, epoch: u32) -> FitnessScore {
    if results.is_empty() {
        return FitnessScore {
            total: 0.0,
            correctness: 0.0,
            latency_ms: 0.0,
            tokens_used: 0.0,
            repair_rate: 0.0,
            cost: 0.0,
            failure_rate: 0.0,
            examples: 0,
            sample_epoch: epoch,
            evaluated_at: Utc::now(),
        };
    }

    let n = results.len() as f64;
    let mean = |f: &dyn Fn(&EvaluationResult) -> f64| results.iter().map(f).sum::<f64>() / n;

    let correctness = mean(&|r| r.correctness);
    let latency_ms = mean(&|r| r.latency_ms as f64);
    let tokens_used = mean(&|r| r.tokens_used as f64);
    let repair_rate = mean(&|r| if r.repaired { 1.0 } else { 0.0 });
    let cost = mean(&|r| r.cost);
    let failure_rate = mean(&|r| if r.failed { 1.0 } else { 0.0 });

    let total = correctness
        - weights.latency * latency_ms
        - weights.tokens * tokens_used
        - weights.repairs * repair_rate
        - weights.cost * cost;

    FitnessScore {
        total,
        correctness,
        latency_ms,
        tokens_used,
        repair_rate,
        cost,
        failure_rate,
        examples: results.len(),
        sample_epoch: epoch,
        evaluated_at: Utc::now(),
    }
}

fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
