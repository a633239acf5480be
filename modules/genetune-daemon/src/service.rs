//! GenetuneService: one handle over the optimizer, the live bandit and the
//! nightly job.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use genetune_bandit::{spawn_reward_feed, ArmStats, BanditError, FeedStats, RewardEvent, ThompsonBandit};
use genetune_common::{FileConfig, Genome, GoldenExample};
use genetune_evolve::{EvolutionOutcome, EvolveError, Executor, RunControl};

use crate::daemon::ImprovementDaemon;
use crate::dataset::DatasetSource;
use crate::report::ImprovementReport;
use crate::reward::RewardModel;

pub struct GenetuneService {
    config: FileConfig,
    bandit: Arc<ThompsonBandit>,
    executor: Arc<dyn Executor>,
    daemon: ImprovementDaemon,
}

impl GenetuneService {
    pub fn new(
        config: FileConfig,
        bandit: Arc<ThompsonBandit>,
        executor: Arc<dyn Executor>,
        dataset: Arc<dyn DatasetSource>,
        reward_model: Option<Arc<dyn RewardModel>>,
    ) -> Self {
        let mut daemon =
            ImprovementDaemon::new(config.clone(), bandit.clone(), executor.clone(), dataset);
        if let Some(model) = reward_model {
            daemon = daemon.with_reward_model(model);
        }
        Self {
            config,
            bandit,
            executor,
            daemon,
        }
    }

    pub fn bandit(&self) -> &Arc<ThompsonBandit> {
        &self.bandit
    }

    pub fn daemon(&self) -> &ImprovementDaemon {
        &self.daemon
    }

    /// One offline optimization run, independent of the bandit.
    pub async fn run_evolution(
        &self,
        dataset: &[GoldenExample],
        seeds: Vec<Genome>,
        control: &RunControl,
    ) -> Result<EvolutionOutcome, EvolveError> {
        genetune_evolve::run_evolution(&self.config, self.executor.clone(), dataset, seeds, control)
            .await
    }

    /// Genome id to serve the next request with.
    pub fn bandit_choose(&self) -> String {
        self.bandit.choose()
    }

    pub fn bandit_update(&self, genome_id: &str, reward: f64) -> Result<ArmStats, BanditError> {
        self.bandit.update(genome_id, reward)
    }

    pub fn bandit_stats(&self) -> Vec<ArmStats> {
        self.bandit.stats()
    }

    pub async fn run_nightly_improvement(&self) -> ImprovementReport {
        self.daemon.run().await
    }

    /// Apply production rewards from `events` until the sender side closes.
    pub fn spawn_reward_feed(&self, events: mpsc::Receiver<RewardEvent>) -> JoinHandle<FeedStats> {
        spawn_reward_feed(self.bandit.clone(), events)
    }
}
