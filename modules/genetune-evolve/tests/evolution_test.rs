//! Integration tests for the EvolutionEngine search loop.
//! All executors are in-process mocks; nothing touches a real backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use genetune_common::{
    BoolDomain, EvolutionConfig, ExecutorConfig, FileConfig, FitnessWeights, FloatRange, Genome,
    GenomeParams, GoldenExample, IntRange, SpaceConfig,
};
use genetune_evolve::{
    run_evolution, EvolutionEngine, EvolveError, ExecutionOutcome, Executor, ExecutorError,
    FitnessEvaluator, GenomeSpace, RunControl, Termination,
};

// ---------------------------------------------------------------------------
// Mock executors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Call {
    genome_id: String,
    example_id: String,
    params: GenomeParams,
}

/// Reports `1 - |temperature - optimum|` as correctness and records every call.
struct Objective {
    optimum: f64,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl Objective {
    fn new(optimum: f64) -> Self {
        Self {
            optimum,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn slow(optimum: f64, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(optimum)
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for Objective {
    async fn execute(
        &self,
        genome: &Genome,
        example: &GoldenExample,
        _timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.lock().unwrap().push(Call {
            genome_id: genome.id.clone(),
            example_id: example.id.clone(),
            params: genome.params().clone(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ExecutionOutcome {
            output: String::new(),
            correctness: 1.0 - (genome.params().temperature - self.optimum).abs(),
            latency_ms: 0,
            tokens_used: 0,
            repaired: false,
            cost: 0.0,
        })
    }
}

/// Same answer for every genome.
struct Flat;

#[async_trait]
impl Executor for Flat {
    async fn execute(
        &self,
        _genome: &Genome,
        _example: &GoldenExample,
        _timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        Ok(ExecutionOutcome {
            output: String::new(),
            correctness: 0.5,
            latency_ms: 0,
            tokens_used: 0,
            repaired: false,
            cost: 0.0,
        })
    }
}

/// Answers the first `limit` calls, then never again.
struct StallsAfter {
    limit: usize,
    answered: AtomicUsize,
}

impl StallsAfter {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            answered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for StallsAfter {
    async fn execute(
        &self,
        genome: &Genome,
        _example: &GoldenExample,
        _timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if self.answered.fetch_add(1, Ordering::SeqCst) >= self.limit {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            return Err(ExecutorError::Transient("never".into()));
        }
        Ok(ExecutionOutcome {
            output: String::new(),
            correctness: 1.0 - (genome.params().temperature - 0.5).abs(),
            latency_ms: 0,
            tokens_used: 0,
            repaired: false,
            cost: 0.0,
        })
    }
}

/// Never answers.
struct Stuck;

#[async_trait]
impl Executor for Stuck {
    async fn execute(
        &self,
        _genome: &Genome,
        _example: &GoldenExample,
        _timeout: Duration,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Err(ExecutorError::Transient("never".into()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn dataset(n: usize) -> Vec<GoldenExample> {
    (0..n)
        .map(|i| GoldenExample {
            id: format!("ex-{i:02}"),
            input: format!("question {i}"),
            expected: format!("answer {i}"),
            category: "synthetic".into(),
        })
        .collect()
}

/// Only temperature varies.
fn temperature_only_space() -> GenomeSpace {
    GenomeSpace::new(SpaceConfig {
        temperature: FloatRange {
            min: 0.0,
            max: 1.0,
            step: 0.05,
        },
        top_p: FloatRange {
            min: 1.0,
            max: 1.0,
            step: 0.0,
        },
        model_keys: vec!["m".into()],
        prompt_variants: vec!["p".into()],
        chain_of_thought: BoolDomain::Fixed(false),
        max_tokens: IntRange {
            min: 256,
            max: 256,
            step: 1,
        },
    })
    .unwrap()
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_in_flight: 8,
        max_retries: 0,
        backoff_base_ms: 1,
        backoff_jitter_ms: 0,
        call_timeout_ms: 60_000,
        ..ExecutorConfig::default()
    }
}

fn evaluator() -> FitnessEvaluator {
    FitnessEvaluator::new(&executor_config(), FitnessWeights::correctness_only())
}

fn engine(config: EvolutionConfig, space: GenomeSpace, executor: Arc<dyn Executor>) -> EvolutionEngine {
    EvolutionEngine::new(config, space, evaluator(), executor).unwrap()
}

fn small_run(seed: u64) -> EvolutionConfig {
    EvolutionConfig {
        population_size: 8,
        survivors: 4,
        eval_samples: 5,
        max_generations: 6,
        stagnation_window: 0,
        seed: Some(seed),
        ..EvolutionConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn converges_on_single_temperature_optimum() {
    let config = EvolutionConfig {
        population_size: 4,
        survivors: 2,
        eval_samples: 4,
        max_generations: 15,
        crossover_prob: 0.0,
        mutation_rate: 0.2,
        stagnation_window: 0,
        top_k: 1,
        seed: Some(42),
        ..EvolutionConfig::default()
    };
    let executor = Arc::new(Objective::new(0.73));
    let mut engine = engine(config, temperature_only_space(), executor);

    let outcome = engine
        .run(&dataset(4), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.termination, Termination::MaxGenerations);
    assert_eq!(outcome.generations_run, 15);
    let best = outcome.best.expect("a best genome");
    let temperature = best.params().temperature;
    assert!(
        (temperature - 0.73).abs() <= 0.05,
        "best temperature {temperature} is not within 0.05 of 0.73"
    );
}

#[tokio::test]
async fn population_size_is_constant_across_generations() {
    let executor = Arc::new(Objective::new(0.4));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut engine = engine(small_run(7), space, executor.clone());

    let outcome = engine
        .run(&dataset(20), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(outcome.history.len(), 6);
    for stats in &outcome.history {
        assert_eq!(stats.population_size, 8);
    }
    // Generation 0 evaluates everyone, later generations only the offspring.
    assert_eq!(outcome.history[0].evaluated, 8);
    for stats in &outcome.history[1..] {
        assert_eq!(stats.evaluated, 4);
    }
    assert_eq!(outcome.top_k.len(), 3);
}

#[tokio::test]
async fn best_fitness_never_decreases_within_a_subset() {
    let executor = Arc::new(Objective::new(1.3));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut engine = engine(small_run(99), space, executor);

    let outcome = engine
        .run(&dataset(20), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    for pair in outcome.history.windows(2) {
        assert!(
            pair[1].best_fitness >= pair[0].best_fitness,
            "best fitness regressed from {} to {}",
            pair[0].best_fitness,
            pair[1].best_fitness
        );
    }
}

#[tokio::test]
async fn every_evaluated_genome_is_inside_the_domain() {
    let executor = Arc::new(Objective::new(0.9));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut config = small_run(3);
    config.crossover_prob = 0.5;
    config.mutation_rate = 0.6;
    let mut engine = engine(config, space.clone(), executor.clone());

    // Out-of-domain seed: must be repaired before it is ever executed.
    let bad_seed = Genome::new(
        GenomeParams {
            temperature: 7.5,
            top_p: -1.0,
            model_key: "retired-model".into(),
            prompt_variant_id: "baseline".into(),
            use_chain_of_thought: true,
            max_tokens: 100_000,
        },
        0,
    );
    let seed_id = bad_seed.id.clone();

    let outcome = engine
        .run(&dataset(10), vec![bad_seed], &RunControl::new())
        .await
        .unwrap();

    let calls = executor.calls();
    assert!(!calls.is_empty());
    for call in &calls {
        space.validate(&call.params).unwrap();
    }
    assert!(calls.iter().any(|c| c.genome_id == seed_id));
    assert!(outcome.evaluated.contains_key(&seed_id));
}

#[tokio::test]
async fn a_generation_shares_one_example_subset() {
    let executor = Arc::new(Objective::new(0.5));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut engine = engine(small_run(11), space, executor.clone());

    let outcome = engine
        .run(&dataset(30), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    let subset: BTreeSet<String> = outcome.history[0].example_ids.iter().cloned().collect();
    assert_eq!(subset.len(), 5);
    for stats in &outcome.history {
        assert_eq!(stats.sample_epoch, 0);
        assert_eq!(stats.example_ids, outcome.history[0].example_ids);
    }

    let mut per_genome: HashMap<String, BTreeSet<String>> = HashMap::new();
    for call in executor.calls() {
        per_genome
            .entry(call.genome_id)
            .or_default()
            .insert(call.example_id);
    }
    for examples in per_genome.values() {
        assert_eq!(examples, &subset);
    }
}

#[tokio::test]
async fn resampling_rescores_survivors_on_the_new_subset() {
    let executor = Arc::new(Objective::new(0.5));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut config = small_run(5);
    config.resample_every = 2;
    let mut engine = engine(config, space, executor);

    let outcome = engine
        .run(&dataset(30), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    let epochs: Vec<u32> = outcome.history.iter().map(|s| s.sample_epoch).collect();
    assert_eq!(epochs, vec![0, 0, 1, 1, 2, 2]);
    // A fresh subset means the whole population is scored again.
    assert_eq!(outcome.history[2].evaluated, 8);
    assert_eq!(outcome.history[4].evaluated, 8);
    assert_eq!(outcome.history[3].evaluated, 4);
}

#[tokio::test]
async fn flat_landscape_stops_on_stagnation() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let config = EvolutionConfig {
        stagnation_window: 3,
        ..small_run(8)
    };
    let mut engine = engine(config, space, Arc::new(Flat));

    let outcome = engine
        .run(&dataset(10), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    assert!(outcome.completed);
    assert_eq!(outcome.history.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_generation_abandons_after_drain() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut engine =
        engine(small_run(1), space, Arc::new(Stuck)).with_drain_timeout(Duration::from_secs(1));
    let control = RunControl::new();
    let cancel = control.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = engine.run(&dataset(10), Vec::new(), &control).await.unwrap();

    assert!(!outcome.completed);
    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(outcome.history.is_empty());
    assert!(outcome.best.is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_best_so_far() {
    let executor = Arc::new(Objective::slow(0.6, Duration::from_millis(10)));
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let config = EvolutionConfig {
        max_generations: 1_000,
        ..small_run(21)
    };
    let mut engine = engine(config, space, executor).with_drain_timeout(Duration::from_secs(5));
    let control = RunControl::new().with_time_budget(Duration::from_millis(95));

    let outcome = engine.run(&dataset(10), Vec::new(), &control).await.unwrap();

    assert!(!outcome.completed);
    assert_eq!(outcome.termination, Termination::DeadlineExceeded);
    assert!(!outcome.history.is_empty());
    assert!(outcome.history.len() < 1_001);
    assert!(outcome.best.is_some());
}

#[tokio::test(start_paused = true)]
async fn abandoned_generation_on_fresh_subset_keeps_last_ranking() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let config = EvolutionConfig {
        population_size: 4,
        survivors: 2,
        eval_samples: 2,
        max_generations: 10,
        resample_every: 1,
        stagnation_window: 0,
        top_k: 2,
        seed: Some(17),
        ..EvolutionConfig::default()
    };
    // Generation 0 is 4 genomes x 2 examples; generation 1 draws a new
    // subset and every call from then on hangs.
    let executor = Arc::new(StallsAfter::new(8));
    let mut engine = engine(config, space, executor).with_drain_timeout(Duration::from_secs(1));
    let control = RunControl::new().with_time_budget(Duration::from_secs(10));

    let outcome = engine.run(&dataset(10), Vec::new(), &control).await.unwrap();

    assert_eq!(outcome.termination, Termination::DeadlineExceeded);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.top_k.len(), 2);
    let best = outcome.best.expect("generation 0 finished");
    assert_eq!(best.id, outcome.history[0].best_genome_id);
    assert_eq!(best.fitness().unwrap().sample_epoch, 0);
    assert_eq!(best.fitness_total(), Some(outcome.history[0].best_fitness));
}

#[tokio::test]
async fn max_generations_counts_generation_zero() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let config = EvolutionConfig {
        max_generations: 1,
        ..small_run(4)
    };
    let mut engine = engine(config, space, Arc::new(Flat));

    let outcome = engine
        .run(&dataset(10), Vec::new(), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::MaxGenerations);
    assert_eq!(outcome.generations_run, 1);
    assert_eq!(outcome.history.len(), 1);
}

#[tokio::test]
async fn empty_dataset_is_rejected() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let mut engine = engine(small_run(2), space, Arc::new(Flat));
    let err = engine
        .run(&[], Vec::new(), &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EvolveError::EmptyDataset));
}

#[tokio::test]
async fn run_evolution_builds_from_file_config() {
    let config = FileConfig {
        evolution: small_run(13),
        executor: executor_config(),
        fitness: FitnessWeights::correctness_only(),
        ..FileConfig::default()
    };
    let outcome = run_evolution(
        &config,
        Arc::new(Objective::new(0.2)),
        &dataset(12),
        Vec::new(),
        &RunControl::new(),
    )
    .await
    .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.generations_run, 6);
    let best = outcome.best.unwrap();
    assert_eq!(best.id, outcome.top_k[0].id);
    assert_eq!(outcome.evaluated.get(&best.id), best.fitness());
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let space = GenomeSpace::new(SpaceConfig::default()).unwrap();
    let config = EvolutionConfig {
        survivors: 0,
        ..EvolutionConfig::default()
    };
    let result = EvolutionEngine::new(config, space, evaluator(), Arc::new(Flat));
    assert!(matches!(result, Err(EvolveError::InvalidConfig(_))));
}
