//! ImprovementDaemon: nightly evolution plus promotion into the live bandit.
//!
//! Every failure before the install step aborts the run without touching the
//! bandit. Installation is the last thing a run does and goes through
//! [`ThompsonBandit::install`], so a promotion batch becomes visible all at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use genetune_bandit::ThompsonBandit;
use genetune_common::{FileConfig, Genome};
use genetune_evolve::{
    run_evolution, Executor, GenomeSpace, PopulationManager, RunControl, Termination,
};

use crate::dataset::DatasetSource;
use crate::report::{
    AbortStage, DaemonAbort, ImprovementReport, PromotedGenome, Rejection, RunStatus,
};
use crate::reward::RewardModel;

pub struct ImprovementDaemon {
    config: FileConfig,
    bandit: Arc<ThompsonBandit>,
    executor: Arc<dyn Executor>,
    dataset: Arc<dyn DatasetSource>,
    reward_model: Option<Arc<dyn RewardModel>>,
    run_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl ImprovementDaemon {
    pub fn new(
        config: FileConfig,
        bandit: Arc<ThompsonBandit>,
        executor: Arc<dyn Executor>,
        dataset: Arc<dyn DatasetSource>,
    ) -> Self {
        Self {
            config,
            bandit,
            executor,
            dataset,
            reward_model: None,
            run_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reward_model(mut self, model: Arc<dyn RewardModel>) -> Self {
        self.reward_model = Some(model);
        self
    }

    /// Cancelling this token aborts the run in progress at the next
    /// generation boundary.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    /// Run once. A run already in progress makes this return a skipped report.
    pub async fn run(&self) -> ImprovementReport {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Another improvement run is in progress, skipping");
            return ImprovementReport::skipped();
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "Improvement run started");

        match self.run_inner(run_id, started_at).await {
            Ok(report) => {
                info!("Improvement run complete. {report}");
                report
            }
            Err(abort) => {
                error!(
                    %run_id,
                    stage = %abort.stage,
                    reason = abort.reason.as_str(),
                    "Improvement run aborted, bandit left untouched"
                );
                ImprovementReport::aborted(run_id, started_at, abort)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ImprovementReport, DaemonAbort> {
        let settings = &self.config.daemon;
        self.config
            .validate()
            .map_err(|e| DaemonAbort::new(AbortStage::Configuration, e.to_string()))?;
        if settings.require_reward_model && self.reward_model.is_none() {
            return Err(DaemonAbort::new(
                AbortStage::RewardModel,
                "a reward model is required but none is configured",
            ));
        }

        // Phase 1: golden dataset
        let examples = self
            .dataset
            .load()
            .await
            .map_err(|e| DaemonAbort::new(AbortStage::LoadDataset, format!("{e:#}")))?;
        if examples.is_empty() {
            return Err(DaemonAbort::new(AbortStage::LoadDataset, "golden dataset is empty"));
        }
        info!(examples = examples.len(), "Golden dataset loaded");

        // Phase 2: seeds from production
        let incumbents = self.bandit.incumbents(settings.incumbent_seeds);
        let seeds = self.seeds(&incumbents)?;
        info!(
            incumbents = incumbents.len(),
            seeds = seeds.len(),
            "Seeding from production genomes"
        );

        // Phase 3: evolution
        let control = RunControl::new()
            .with_cancel(self.cancel.child_token())
            .with_time_budget(settings.time_budget());
        let outcome = run_evolution(
            &self.config,
            self.executor.clone(),
            &examples,
            seeds,
            &control,
        )
        .await
        .map_err(|e| DaemonAbort::new(AbortStage::Evolution, e.to_string()))?;

        if outcome.termination == Termination::Cancelled {
            return Err(DaemonAbort::new(AbortStage::Evolution, "run was cancelled"));
        }
        if outcome.top_k.is_empty() {
            return Err(DaemonAbort::new(
                AbortStage::Evolution,
                format!("no generation finished evaluating ({})", outcome.termination),
            ));
        }
        if outcome
            .top_k
            .iter()
            .all(|g| g.fitness().map_or(true, |f| f.failure_rate >= 1.0))
        {
            return Err(DaemonAbort::new(
                AbortStage::Evolution,
                "every evaluation failed, the executor looks unavailable",
            ));
        }
        if outcome.termination == Termination::DeadlineExceeded {
            warn!("Time budget exhausted, promoting from the best generation so far");
        }

        // Phase 4: candidate filtering
        let mut promoted: Vec<PromotedGenome> = Vec::new();
        let mut rejected: Vec<Rejection> = Vec::new();
        let incumbent = incumbents.first();
        for genome in &outcome.top_k {
            if promoted.len() >= settings.promote_top_k {
                rejected.push(reject(genome, "promotion limit reached"));
                continue;
            }
            if self.bandit.contains(&genome.id) {
                rejected.push(reject(genome, "already deployed"));
                continue;
            }
            let Some(fitness) = genome.fitness() else {
                rejected.push(reject(genome, "not scored"));
                continue;
            };
            if fitness.failure_rate > settings.max_failure_rate {
                rejected.push(reject(
                    genome,
                    format!(
                        "failure rate {:.2} above {:.2}",
                        fitness.failure_rate, settings.max_failure_rate
                    ),
                ));
                continue;
            }

            let predicted_reward = match &self.reward_model {
                Some(model) => Some(model.predict(genome).await.map_err(|e| {
                    DaemonAbort::new(
                        AbortStage::RewardModel,
                        format!("prediction for {} failed: {e:#}", genome.id),
                    )
                })?),
                None => None,
            };
            if let (Some(reward), Some(threshold)) = (predicted_reward, settings.reward_threshold) {
                if reward < threshold {
                    rejected.push(reject(
                        genome,
                        format!("predicted reward {reward:.3} below {threshold:.3}"),
                    ));
                    continue;
                }
            }

            promoted.push(PromotedGenome {
                genome: genome.clone(),
                fitness: fitness.total,
                predicted_reward,
                compared_to: incumbent.map(|g| g.id.clone()),
                changes: incumbent
                    .map(|g| genome.params().diff(g.params()))
                    .unwrap_or_default(),
            });
        }
        for rejection in &rejected {
            info!(
                genome_id = rejection.genome_id.as_str(),
                reason = rejection.reason.as_str(),
                "Candidate not promoted"
            );
        }

        // Only an incumbent score from the best genome's example subset is
        // comparable to it.
        let best = outcome.best.as_ref().and_then(Genome::fitness);
        let best_fitness = best.map(|f| f.total);
        let incumbent_fitness = best.and_then(|best| {
            incumbents
                .iter()
                .filter_map(|g| outcome.evaluated.get(&g.id))
                .filter(|score| score.sample_epoch == best.sample_epoch)
                .map(|score| score.total)
                .max_by(f64::total_cmp)
        });
        if !incumbents.is_empty() && incumbent_fitness.is_none() {
            warn!("No incumbent was scored on the final example subset, not recommending a deploy");
        }
        let recommend_deploy = match (best_fitness, incumbent_fitness) {
            (Some(best), Some(current)) => {
                !promoted.is_empty() && best > current + settings.deploy_margin
            }
            (Some(_), None) => !promoted.is_empty() && incumbents.is_empty(),
            _ => false,
        };

        // Phase 5: install
        let installed = self
            .bandit
            .install(promoted.iter().map(|p| p.genome.clone()).collect());
        info!(
            installed = installed.len(),
            arms = self.bandit.len(),
            recommend_deploy,
            "Promotion installed"
        );

        let mut report = ImprovementReport::new(run_id, started_at, RunStatus::Completed);
        report.termination = Some(outcome.termination);
        report.history = outcome.history;
        report.promoted = promoted;
        report.rejected = rejected;
        report.incumbent_fitness = incumbent_fitness;
        report.best_fitness = best_fitness;
        report.recommend_deploy = recommend_deploy;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Incumbents followed by mutated variants of each. The engine fills the
    /// remaining slots with stratified random genomes. Config validation
    /// guarantees the seeds fit the population.
    fn seeds(&self, incumbents: &[Genome]) -> Result<Vec<Genome>, DaemonAbort> {
        let space = GenomeSpace::new(self.config.space.clone())
            .map_err(|e| DaemonAbort::new(AbortStage::Configuration, e.to_string()))?;
        let manager = PopulationManager::from_config(&self.config.evolution);
        let mut rng = match self.config.evolution.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_os_rng(),
        };

        let mut seeds = incumbents.to_vec();
        for incumbent in incumbents {
            for _ in 0..self.config.daemon.incumbent_variants {
                seeds.push(manager.mutate(incumbent, 0, &space, &mut rng));
            }
        }
        Ok(seeds)
    }
}

fn reject(genome: &Genome, reason: impl Into<String>) -> Rejection {
    Rejection {
        genome_id: genome.id.clone(),
        reason: reason.into(),
    }
}
