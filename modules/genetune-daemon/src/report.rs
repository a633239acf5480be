use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use genetune_common::{Genome, ParamChange};
use genetune_evolve::{GenerationStats, Termination};

/// Where an improvement run gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortStage {
    Configuration,
    LoadDataset,
    Evolution,
    RewardModel,
}

impl fmt::Display for AbortStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::LoadDataset => write!(f, "load_dataset"),
            Self::Evolution => write!(f, "evolution"),
            Self::RewardModel => write!(f, "reward_model"),
        }
    }
}

/// A run ended before touching the bandit.
#[derive(Debug, Clone, Error)]
#[error("improvement run aborted during {stage}: {reason}")]
pub struct DaemonAbort {
    pub stage: AbortStage,
    pub reason: String,
}

impl DaemonAbort {
    pub fn new(stage: AbortStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted { stage: AbortStage, reason: String },
    /// Another run held the lock.
    Skipped,
}

/// A candidate that made it into the bandit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotedGenome {
    pub genome: Genome,
    pub fitness: f64,
    pub predicted_reward: Option<f64>,
    /// Incumbent the diff is taken against.
    pub compared_to: Option<String>,
    pub changes: Vec<ParamChange>,
}

/// A candidate that was filtered out, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub genome_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub termination: Option<Termination>,
    pub history: Vec<GenerationStats>,
    pub promoted: Vec<PromotedGenome>,
    pub rejected: Vec<Rejection>,
    pub incumbent_fitness: Option<f64>,
    pub best_fitness: Option<f64>,
    /// New best beats the incumbent by more than the configured margin.
    pub recommend_deploy: bool,
}

impl ImprovementReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, status: RunStatus) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            termination: None,
            history: Vec::new(),
            promoted: Vec::new(),
            rejected: Vec::new(),
            incumbent_fitness: None,
            best_fitness: None,
            recommend_deploy: false,
        }
    }

    pub fn aborted(run_id: Uuid, started_at: DateTime<Utc>, abort: DaemonAbort) -> Self {
        Self::new(
            run_id,
            started_at,
            RunStatus::Aborted {
                stage: abort.stage,
                reason: abort.reason,
            },
        )
    }

    pub fn skipped() -> Self {
        Self::new(Uuid::new_v4(), Utc::now(), RunStatus::Skipped)
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn promoted_ids(&self) -> Vec<&str> {
        self.promoted.iter().map(|p| p.genome.id.as_str()).collect()
    }
}

impl fmt::Display for ImprovementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            RunStatus::Completed => "completed".to_string(),
            RunStatus::Aborted { stage, reason } => format!("aborted at {stage} ({reason})"),
            RunStatus::Skipped => "skipped".to_string(),
        };
        let fmt_fitness = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{v:.4}"));
        write!(
            f,
            "run={} status={} generations={} promoted={} rejected={} best={} incumbent={} recommend_deploy={}",
            self.run_id,
            status,
            self.history.len(),
            self.promoted.len(),
            self.rejected.len(),
            fmt_fitness(self.best_fitness),
            fmt_fitness(self.incumbent_fitness),
            self.recommend_deploy,
        )
    }
}
