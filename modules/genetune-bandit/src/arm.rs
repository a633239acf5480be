//! Beta-posterior arms and their priors.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use genetune_common::BanditConfig;

/// Posterior over one deployed genome's success rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditArm {
    pub genome_id: String,
    /// Pseudo-successes.
    pub alpha: f64,
    /// Pseudo-failures.
    pub beta: f64,
    /// Rewards applied so far.
    pub pulls: u64,
    pub cumulative_reward: f64,
    pub created_at: DateTime<Utc>,
}

impl BanditArm {
    pub fn new(genome_id: impl Into<String>, alpha: f64, beta: f64) -> Self {
        Self {
            genome_id: genome_id.into(),
            alpha,
            beta,
            pulls: 0,
            cumulative_reward: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Posterior mean: `alpha / (alpha + beta)`.
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// One Thompson draw from `Beta(alpha, beta)`.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(beta) => beta.sample(rng),
            // Parameters are kept positive; fall back to the mean regardless.
            Err(_) => self.mean(),
        }
    }

    /// Soft-Bernoulli update: a reward `r` in `[0, 1]` counts as `r`
    /// successes and `1 - r` failures. Binary rewards reduce to the exact
    /// Beta-Bernoulli conjugate update.
    pub fn record(&mut self, reward: f64) {
        self.alpha += reward;
        self.beta += 1.0 - reward;
        self.pulls += 1;
        self.cumulative_reward += reward;
    }

    pub fn reset(&mut self, alpha: f64, beta: f64) {
        self.alpha = alpha;
        self.beta = beta;
        self.pulls = 0;
        self.cumulative_reward = 0.0;
    }

    pub fn stats(&self) -> ArmStats {
        ArmStats {
            genome_id: self.genome_id.clone(),
            pulls: self.pulls,
            mean_reward: self.mean(),
            alpha: self.alpha,
            beta: self.beta,
            cumulative_reward: self.cumulative_reward,
        }
    }
}

/// Read-only view of an arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub genome_id: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub alpha: f64,
    pub beta: f64,
    pub cumulative_reward: f64,
}

/// Starting posterior for a newly installed arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArmPrior {
    Fixed { alpha0: f64, beta0: f64 },
    /// Offline fitness `f` (clamped to `[0, 1]`) buys `strength` pseudo-observations:
    /// `alpha0 + strength·f`, `beta0 + strength·(1 − f)`.
    WarmStart { alpha0: f64, beta0: f64, strength: f64 },
}

impl ArmPrior {
    pub fn from_config(config: &BanditConfig) -> Self {
        if config.warm_start_strength > 0.0 {
            Self::WarmStart {
                alpha0: config.alpha0,
                beta0: config.beta0,
                strength: config.warm_start_strength,
            }
        } else {
            Self::Fixed {
                alpha0: config.alpha0,
                beta0: config.beta0,
            }
        }
    }

    /// The plain `(alpha0, beta0)` pair.
    pub fn base(&self) -> (f64, f64) {
        match *self {
            Self::Fixed { alpha0, beta0 } | Self::WarmStart { alpha0, beta0, .. } => (alpha0, beta0),
        }
    }

    /// Parameters for a new arm whose genome scored `fitness` offline.
    pub fn initial(&self, fitness: Option<f64>) -> (f64, f64) {
        match (*self, fitness) {
            (
                Self::WarmStart {
                    alpha0,
                    beta0,
                    strength,
                },
                Some(f),
            ) if f.is_finite() => {
                let f = f.clamp(0.0, 1.0);
                (alpha0 + strength * f, beta0 + strength * (1.0 - f))
            }
            _ => self.base(),
        }
    }
}

impl Default for ArmPrior {
    fn default() -> Self {
        Self::Fixed {
            alpha0: 1.0,
            beta0: 1.0,
        }
    }
}
