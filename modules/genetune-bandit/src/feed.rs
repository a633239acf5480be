//! Production reward feed: applies rewards arriving over a channel.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bandit::ThompsonBandit;
use crate::error::BanditError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEvent {
    pub genome_id: String,
    pub reward: f64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedStats {
    pub applied: u64,
    pub unknown_arm: u64,
    pub invalid_reward: u64,
}

impl fmt::Display for FeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied={} unknown_arm={} invalid_reward={}",
            self.applied, self.unknown_arm, self.invalid_reward
        )
    }
}

/// Drain `rx` into `bandit` until every sender is dropped.
pub fn spawn_reward_feed(
    bandit: Arc<ThompsonBandit>,
    mut rx: mpsc::Receiver<RewardEvent>,
) -> JoinHandle<FeedStats> {
    tokio::spawn(async move {
        let mut stats = FeedStats::default();
        while let Some(event) = rx.recv().await {
            match bandit.update(&event.genome_id, event.reward) {
                Ok(_) => stats.applied += 1,
                Err(BanditError::UnknownArm(id)) => {
                    warn!(genome_id = id.as_str(), "Reward for undeployed genome dropped");
                    stats.unknown_arm += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Reward rejected");
                    stats.invalid_reward += 1;
                }
            }
        }
        info!(%stats, "Reward feed closed");
        stats
    })
}
