//! Reward models predict how a candidate will fare in production.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use genetune_common::Genome;

#[async_trait]
pub trait RewardModel: Send + Sync {
    /// Predicted production reward in `[0, 1]`.
    async fn predict(&self, genome: &Genome) -> Result<f64>;
}

/// Uses the offline correctness measured during evolution as the prediction.
pub struct OfflineCorrectness;

#[async_trait]
impl RewardModel for OfflineCorrectness {
    async fn predict(&self, genome: &Genome) -> Result<f64> {
        genome
            .fitness()
            .map(|f| f.correctness.clamp(0.0, 1.0))
            .ok_or_else(|| anyhow!("genome {} has no offline fitness", genome.id))
    }
}
