//! EvolutionEngine: the generational search loop.
//!
//! `Initialized → Evaluating → Selecting → Reproducing → Evaluating → … → Terminated`
//!
//! Selection never starts before every genome of the generation has a score
//! for the current example subset. Cancellation and deadlines are only acted
//! on at generation boundaries; a stop that lands mid-evaluation lets in-flight
//! calls drain for a bounded time, then abandons the incomplete generation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use genetune_common::{EvolutionConfig, FileConfig, FitnessScore, Genome, GoldenExample};

use crate::error::EvolveError;
use crate::executor::Executor;
use crate::fitness::{ExampleSubset, FitnessEvaluator};
use crate::population::PopulationManager;
use crate::space::GenomeSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Initialized,
    Evaluating,
    Selecting,
    Reproducing,
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Selecting => write!(f, "selecting"),
            Self::Reproducing => write!(f, "reproducing"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    MaxGenerations,
    /// Best fitness stagnated for `stagnation_window` generations.
    Converged,
    Cancelled,
    DeadlineExceeded,
}

impl Termination {
    /// Cancellation and deadlines cut a run short; everything else completes it.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::MaxGenerations | Self::Converged)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxGenerations => write!(f, "max_generations"),
            Self::Converged => write!(f, "converged"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// Summary of one fully evaluated generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub generation: u32,
    pub best_fitness: f64,
    pub mean_fitness: f64,
    pub best_genome_id: String,
    pub population_size: usize,
    /// Genomes that needed an evaluation this generation (survivors with a
    /// current score are not re-run).
    pub evaluated: usize,
    pub sample_epoch: u32,
    pub example_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EvolutionOutcome {
    /// `None` only when no generation finished evaluating.
    pub best: Option<Genome>,
    pub top_k: Vec<Genome>,
    pub history: Vec<GenerationStats>,
    pub completed: bool,
    /// Fully evaluated generations, generation 0 included.
    pub generations_run: u32,
    pub termination: Termination,
    /// Latest score of every genome evaluated during the run, by id. Check
    /// `sample_epoch` before comparing two entries.
    pub evaluated: BTreeMap<String, FitnessScore>,
}

/// Cancellation token plus optional wall-clock deadline.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_time_budget(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Set once the token is cancelled or the deadline has passed.
    pub fn stop_reason(&self) -> Option<Termination> {
        if self.cancel.is_cancelled() {
            return Some(Termination::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Termination::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when either stop condition fires.
    pub async fn stopped(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

pub struct EvolutionEngine {
    config: EvolutionConfig,
    space: GenomeSpace,
    manager: PopulationManager,
    evaluator: FitnessEvaluator,
    executor: Arc<dyn Executor>,
    drain_timeout: Duration,
    rng: StdRng,
    state: EngineState,
}

impl EvolutionEngine {
    pub fn new(
        config: EvolutionConfig,
        space: GenomeSpace,
        evaluator: FitnessEvaluator,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, EvolveError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            manager: PopulationManager::from_config(&config),
            config,
            space,
            evaluator,
            executor,
            drain_timeout: Duration::from_secs(30),
            rng,
            state: EngineState::Initialized,
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn space(&self) -> &GenomeSpace {
        &self.space
    }

    /// Run generations until a termination condition holds.
    ///
    /// `seeds` are repaired, deduplicated by id and topped up with stratified
    /// random genomes. Their cached fitness is discarded.
    pub async fn run(
        &mut self,
        dataset: &[GoldenExample],
        seeds: Vec<Genome>,
        control: &RunControl,
    ) -> Result<EvolutionOutcome, EvolveError> {
        if dataset.is_empty() {
            return Err(EvolveError::EmptyDataset);
        }
        self.transition(EngineState::Initialized);

        let mut epoch = 0u32;
        let mut subset =
            ExampleSubset::sample(dataset, self.config.eval_samples, epoch, &mut self.rng);
        let mut population = self.initial_population(seeds);
        info!(
            population = population.len(),
            examples = subset.len(),
            max_generations = self.config.max_generations,
            "Evolution started"
        );

        let mut history: Vec<GenerationStats> = Vec::new();
        let mut evaluated: BTreeMap<String, FitnessScore> = BTreeMap::new();
        let mut previous_best: Option<f64> = None;
        let mut stagnant = 0u32;
        let mut generation = 0u32;

        let termination = loop {
            if generation > 0
                && self.config.resample_every > 0
                && generation % self.config.resample_every == 0
            {
                epoch += 1;
                subset =
                    ExampleSubset::sample(dataset, self.config.eval_samples, epoch, &mut self.rng);
                previous_best = None;
                stagnant = 0;
                info!(generation, epoch, "Drew a fresh example subset");
            }

            self.transition(EngineState::Evaluating);
            let Some(fresh) = self
                .evaluate_generation(&mut population, &subset, control)
                .await
            else {
                break control.stop_reason().unwrap_or(Termination::Cancelled);
            };

            for genome in &population {
                if let Some(score) = genome.fitness() {
                    evaluated.insert(genome.id.clone(), score.clone());
                }
            }
            let stats = generation_stats(generation, &population, fresh, &subset);
            info!(
                generation,
                best = stats.best_fitness,
                mean = stats.mean_fitness,
                evaluated = fresh,
                "Generation evaluated"
            );
            let best = stats.best_fitness;
            history.push(stats);

            if generation + 1 >= self.config.max_generations {
                break Termination::MaxGenerations;
            }
            match previous_best {
                Some(prev) if best - prev < self.config.epsilon => stagnant += 1,
                _ => stagnant = 0,
            }
            previous_best = Some(best);
            if self.config.stagnation_window > 0 && stagnant >= self.config.stagnation_window {
                break Termination::Converged;
            }
            if let Some(reason) = control.stop_reason() {
                break reason;
            }

            self.transition(EngineState::Selecting);
            let survivors = self.manager.select(population, self.config.survivors);

            self.transition(EngineState::Reproducing);
            generation += 1;
            population = self.manager.reproduce(
                &survivors,
                self.config.population_size,
                generation,
                &self.space,
                &mut self.rng,
            );
        };

        self.transition(EngineState::Terminated);

        // Rank on the subset of the last finished generation. An abandoned
        // generation may already have moved to a fresh subset.
        let ranking_epoch = history.last().map(|s| s.sample_epoch);
        let mut ranked: Vec<Genome> = population
            .into_iter()
            .filter(|g| {
                ranking_epoch.is_some_and(|epoch| g.fitness().is_some_and(|f| f.sample_epoch == epoch))
            })
            .collect();
        PopulationManager::rank(&mut ranked);
        ranked.truncate(self.config.top_k);

        let completed = termination.is_completed();
        if completed {
            info!(%termination, generations = history.len(), "Evolution finished");
        } else {
            warn!(%termination, generations = history.len(), "Evolution stopped early");
        }

        Ok(EvolutionOutcome {
            best: ranked.first().cloned(),
            top_k: ranked,
            generations_run: history.len() as u32,
            history,
            completed,
            termination,
            evaluated,
        })
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "Engine state change");
        self.state = next;
    }

    fn initial_population(&mut self, seeds: Vec<Genome>) -> Vec<Genome> {
        let mut seen = HashSet::new();
        let mut population: Vec<Genome> = Vec::with_capacity(self.config.population_size);
        for mut seed in seeds {
            if population.len() >= self.config.population_size {
                break;
            }
            if !seen.insert(seed.id.clone()) {
                continue;
            }
            seed.clear_fitness();
            population.push(self.space.repair(seed, &mut self.rng));
        }

        let missing = self.config.population_size - population.len();
        if missing > 0 {
            population.extend(self.space.seed_population(missing, 0, &mut self.rng));
        }
        population
    }

    /// Score every genome lacking a current-epoch fitness. Returns how many
    /// were evaluated, or `None` if a stop arrived and the drain timed out.
    async fn evaluate_generation(
        &self,
        population: &mut [Genome],
        subset: &ExampleSubset,
        control: &RunControl,
    ) -> Option<usize> {
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, g)| g.fitness().map_or(true, |f| f.sample_epoch != subset.epoch))
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Some(0);
        }
        let batch: Vec<Genome> = pending.iter().map(|&i| population[i].clone()).collect();

        let evaluation =
            self.evaluator
                .evaluate_population(&batch, subset, self.executor.as_ref());
        tokio::pin!(evaluation);

        let results = tokio::select! {
            biased;
            results = &mut evaluation => results,
            _ = control.stopped() => {
                warn!(
                    drain_ms = self.drain_timeout.as_millis() as u64,
                    "Stop requested mid-generation, draining in-flight calls"
                );
                match tokio::time::timeout(self.drain_timeout, &mut evaluation).await {
                    Ok(results) => results,
                    Err(_) => {
                        warn!("Drain timed out, abandoning incomplete generation");
                        return None;
                    }
                }
            }
        };

        for (index, rows) in pending.iter().zip(results) {
            let score = self.evaluator.score(&rows, subset.epoch);
            population[*index].set_fitness(score);
        }
        Some(pending.len())
    }
}

fn generation_stats(
    generation: u32,
    population: &[Genome],
    evaluated: usize,
    subset: &ExampleSubset,
) -> GenerationStats {
    let scored: Vec<(&Genome, f64)> = population
        .iter()
        .filter_map(|g| g.fitness_total().map(|t| (g, t)))
        .collect();
    let (best_genome_id, best_fitness) = scored
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.id.cmp(&a.0.id)))
        .map(|(g, t)| (g.id.clone(), *t))
        .unwrap_or_default();
    let mean_fitness = if scored.is_empty() {
        0.0
    } else {
        scored.iter().map(|(_, t)| t).sum::<f64>() / scored.len() as f64
    };

    GenerationStats {
        generation,
        best_fitness,
        mean_fitness,
        best_genome_id,
        population_size: population.len(),
        evaluated,
        sample_epoch: subset.epoch,
        example_ids: subset.ids(),
    }
}

/// Build the space, evaluator and engine from a [`FileConfig`] and run once.
pub async fn run_evolution(
    config: &FileConfig,
    executor: Arc<dyn Executor>,
    dataset: &[GoldenExample],
    seeds: Vec<Genome>,
    control: &RunControl,
) -> Result<EvolutionOutcome, EvolveError> {
    config.validate()?;
    let space = GenomeSpace::new(config.space.clone())?;
    let evaluator = FitnessEvaluator::new(&config.executor, config.fitness.clone());
    let mut engine = EvolutionEngine::new(config.evolution.clone(), space, evaluator, executor)?
        .with_drain_timeout(config.executor.drain_timeout());
    engine.run(dataset, seeds, control).await
}
