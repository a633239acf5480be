//! ThompsonBandit: online allocation between deployed genomes.
//!
//! The arm table sits behind one `RwLock`; each arm has its own `Mutex`, so
//! concurrent `update` calls on different arms never contend and calls on the
//! same arm are serialized. `install` takes the table write lock, making a
//! promotion batch visible to `choose` all at once.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use genetune_common::{BanditConfig, ConfigError, Genome};

use crate::arm::{ArmPrior, ArmStats, BanditArm};
use crate::error::BanditError;

struct Deployed {
    arm: Mutex<BanditArm>,
    genome: Genome,
}

impl Deployed {
    fn arm(&self) -> BanditArm {
        self.arm.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Serializable image of the whole table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub default_genome_id: String,
    pub prior: ArmPrior,
    /// Sorted by genome id.
    pub arms: Vec<ArmRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmRecord {
    pub arm: BanditArm,
    pub genome: Genome,
}

pub struct ThompsonBandit {
    table: RwLock<BTreeMap<String, Deployed>>,
    rng: Mutex<StdRng>,
    default_genome_id: String,
    prior: ArmPrior,
}

impl ThompsonBandit {
    pub fn new(config: &BanditConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            table: RwLock::new(BTreeMap::new()),
            rng: Mutex::new(seeded(config.seed)),
            default_genome_id: config.default_genome_id.clone(),
            prior: ArmPrior::from_config(config),
        })
    }

    /// Rebuild from a snapshot. The random source comes from `seed`, not the snapshot.
    pub fn from_snapshot(snapshot: BanditSnapshot, seed: Option<u64>) -> Self {
        let table = snapshot
            .arms
            .into_iter()
            .map(|record| {
                (
                    record.arm.genome_id.clone(),
                    Deployed {
                        arm: Mutex::new(record.arm),
                        genome: record.genome,
                    },
                )
            })
            .collect();
        Self {
            table: RwLock::new(table),
            rng: Mutex::new(seeded(seed)),
            default_genome_id: snapshot.default_genome_id,
            prior: snapshot.prior,
        }
    }

    pub fn snapshot(&self) -> BanditSnapshot {
        let table = self.read();
        BanditSnapshot {
            default_genome_id: self.default_genome_id.clone(),
            prior: self.prior,
            arms: table
                .values()
                .map(|d| ArmRecord {
                    arm: d.arm(),
                    genome: d.genome.clone(),
                })
                .collect(),
        }
    }

    pub fn default_genome_id(&self) -> &str {
        &self.default_genome_id
    }

    pub fn prior(&self) -> ArmPrior {
        self.prior
    }

    /// Sample every arm's posterior and return the argmax. Ties go to the
    /// lowest genome id; an empty table yields the default id.
    pub fn choose(&self) -> String {
        let table = self.read();
        if table.is_empty() {
            return self.default_genome_id.clone();
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(&str, f64)> = None;
        // BTreeMap iterates in id order, so strict `>` keeps the lowest id on ties.
        for (id, deployed) in table.iter() {
            let draw = deployed
                .arm
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sample(&mut *rng);
            match best {
                Some((_, top)) if draw <= top => {}
                _ => best = Some((id.as_str(), draw)),
            }
        }
        best.map(|(id, _)| id.to_string())
            .unwrap_or_else(|| self.default_genome_id.clone())
    }

    /// Parameters of a deployed genome.
    pub fn genome(&self, genome_id: &str) -> Option<Genome> {
        self.read().get(genome_id).map(|d| d.genome.clone())
    }

    /// Apply one production reward.
    pub fn update(&self, genome_id: &str, reward: f64) -> Result<ArmStats, BanditError> {
        if !reward.is_finite() || !(0.0..=1.0).contains(&reward) {
            return Err(BanditError::InvalidReward {
                genome_id: genome_id.to_string(),
                reward,
            });
        }
        let table = self.read();
        let deployed = table
            .get(genome_id)
            .ok_or_else(|| BanditError::UnknownArm(genome_id.to_string()))?;
        let mut arm = deployed.arm.lock().unwrap_or_else(PoisonError::into_inner);
        arm.record(reward);
        debug!(genome_id, reward, pulls = arm.pulls, mean = arm.mean(), "Reward applied");
        Ok(arm.stats())
    }

    /// Stats for every arm, sorted by genome id.
    pub fn stats(&self) -> Vec<ArmStats> {
        self.read().values().map(|d| d.arm().stats()).collect()
    }

    pub fn arm_stats(&self, genome_id: &str) -> Option<ArmStats> {
        self.read().get(genome_id).map(|d| d.arm().stats())
    }

    pub fn contains(&self, genome_id: &str) -> bool {
        self.read().contains_key(genome_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Add new arms in one step. Genomes already deployed are skipped and
    /// keep their posterior. Returns the ids that were actually added.
    pub fn install(&self, candidates: Vec<Genome>) -> Vec<String> {
        let mut table = self.write();
        let mut installed = Vec::new();
        for genome in candidates {
            if table.contains_key(&genome.id) {
                debug!(genome_id = genome.id.as_str(), "Already deployed, keeping existing arm");
                continue;
            }
            let (alpha, beta) = self.prior.initial(genome.fitness_total());
            let arm = BanditArm::new(genome.id.clone(), alpha, beta);
            installed.push(genome.id.clone());
            table.insert(
                genome.id.clone(),
                Deployed {
                    arm: Mutex::new(arm),
                    genome,
                },
            );
        }
        if !installed.is_empty() {
            info!(count = installed.len(), arms = table.len(), "Installed new arms");
        }
        installed
    }

    /// Remove arms with at least `min_pulls` rewards whose posterior mean fell
    /// below `floor`. Returns the removed ids.
    pub fn prune(&self, min_pulls: u64, floor: f64) -> Vec<String> {
        let mut table = self.write();
        let doomed: Vec<String> = table
            .iter()
            .filter_map(|(id, d)| {
                let arm = d.arm();
                (arm.pulls >= min_pulls && arm.mean() < floor).then(|| id.clone())
            })
            .collect();
        for id in &doomed {
            table.remove(id);
        }
        if !doomed.is_empty() {
            warn!(removed = ?doomed, min_pulls, floor, "Pruned underperforming arms");
        }
        doomed
    }

    /// Forget everything learned about one arm.
    pub fn reset_arm(&self, genome_id: &str) -> Result<ArmStats, BanditError> {
        let table = self.read();
        let deployed = table
            .get(genome_id)
            .ok_or_else(|| BanditError::UnknownArm(genome_id.to_string()))?;
        let (alpha, beta) = self.prior.initial(deployed.genome.fitness_total());
        let mut arm = deployed.arm.lock().unwrap_or_else(PoisonError::into_inner);
        arm.reset(alpha, beta);
        info!(genome_id, alpha, beta, "Arm reset to prior");
        Ok(arm.stats())
    }

    pub fn remove_arm(&self, genome_id: &str) -> Result<Genome, BanditError> {
        let removed = self
            .write()
            .remove(genome_id)
            .ok_or_else(|| BanditError::UnknownArm(genome_id.to_string()))?;
        info!(genome_id, "Arm removed");
        Ok(removed.genome)
    }

    /// Top `k` deployed genomes by posterior mean (ties by id).
    pub fn incumbents(&self, k: usize) -> Vec<Genome> {
        let table = self.read();
        let mut ranked: Vec<(f64, &Deployed)> = table.values().map(|d| (d.arm().mean(), d)).collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.genome.id.cmp(&b.1.genome.id)));
        ranked
            .into_iter()
            .take(k)
            .map(|(_, d)| d.genome.clone())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Deployed>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Deployed>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
