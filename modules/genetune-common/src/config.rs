use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// TOML-backed configuration loaded from disk. Every section is optional and
/// falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub fitness: FitnessWeights,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub space: SpaceConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl FileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.evolution.validate()?;
        self.executor.validate()?;
        self.space.validate()?;
        self.bandit.validate()?;
        self.daemon.validate()?;

        let seeds = self
            .daemon
            .incumbent_seeds
            .saturating_mul(self.daemon.incumbent_variants.saturating_add(1));
        if seeds > self.evolution.population_size {
            return Err(ConfigError::Daemon(format!(
                "incumbent_seeds * (incumbent_variants + 1) = {seeds} exceeds population_size {}",
                self.evolution.population_size
            )));
        }
        Ok(())
    }
}

/// Load, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

// =============================================================================
// Evolution
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvolutionConfig {
    pub population_size: usize,
    /// Top genomes kept unconditionally each generation.
    pub survivors: usize,
    /// Size of the golden subset every genome is scored against.
    pub eval_samples: usize,
    /// Generations evaluated before stopping, generation 0 included.
    pub max_generations: u32,
    pub crossover_prob: f64,
    /// Chance that each additional tunable field is perturbed during mutation.
    pub mutation_rate: f64,
    /// Consecutive generations with improvement below `epsilon` before stopping.
    /// Zero disables early stopping.
    pub stagnation_window: u32,
    pub epsilon: f64,
    /// Draw a fresh example subset every N generations. Zero keeps one subset
    /// for the whole run.
    pub resample_every: u32,
    pub top_k: usize,
    pub seed: Option<u64>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 12,
            survivors: 6,
            eval_samples: 64,
            max_generations: 15,
            crossover_prob: 0.3,
            mutation_rate: 0.2,
            stagnation_window: 3,
            epsilon: 1e-3,
            resample_every: 0,
            top_k: 3,
            seed: None,
        }
    }
}

impl EvolutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 {
            return Err(ConfigError::Evolution("population_size must be at least 1".into()));
        }
        if self.survivors == 0 || self.survivors > self.population_size {
            return Err(ConfigError::Evolution(format!(
                "survivors must be in 1..={}, got {}",
                self.population_size, self.survivors
            )));
        }
        if self.eval_samples == 0 {
            return Err(ConfigError::Evolution("eval_samples must be at least 1".into()));
        }
        if self.max_generations == 0 {
            return Err(ConfigError::Evolution("max_generations must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.crossover_prob) {
            return Err(ConfigError::Evolution(format!(
                "crossover_prob must be in [0, 1], got {}",
                self.crossover_prob
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(ConfigError::Evolution(format!(
                "mutation_rate must be in [0, 1], got {}",
                self.mutation_rate
            )));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ConfigError::Evolution("epsilon must be a non-negative number".into()));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Evolution("top_k must be at least 1".into()));
        }
        Ok(())
    }
}

/// Penalty weights applied to the mean of each cost dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitnessWeights {
    /// Per millisecond of latency.
    pub latency: f64,
    /// Per token used.
    pub tokens: f64,
    /// Per repaired output (applied to the repair rate).
    pub repairs: f64,
    /// Per unit of backend cost.
    pub cost: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            latency: 1e-4,
            tokens: 1e-4,
            repairs: 0.1,
            cost: 1.0,
        }
    }
}

impl FitnessWeights {
    /// Correctness only. Useful when the executor reports a synthetic objective.
    pub fn correctness_only() -> Self {
        Self {
            latency: 0.0,
            tokens: 0.0,
            repairs: 0.0,
            cost: 0.0,
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// How correctness is computed from executor output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    /// Trust the correctness value the executor reports.
    #[default]
    Executor,
    ExactMatch,
    /// Case- and whitespace-insensitive match.
    NormalizedMatch,
    /// Expected answer appears somewhere in the output.
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Upper bound on concurrent executor calls (backend rate limit).
    pub max_in_flight: usize,
    pub max_retries: u32,
    /// Retry delay is `backoff_base_ms * 3^attempt` plus jitter.
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    pub call_timeout_ms: u64,
    /// How long in-flight calls may drain after cancellation.
    pub drain_timeout_ms: u64,
    /// Cost charged to an example whose retries were exhausted.
    pub failure_cost: f64,
    pub grading: GradingMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_jitter_ms: 250,
            call_timeout_ms: 30_000,
            drain_timeout_ms: 30_000,
            failure_cost: 1.0,
            grading: GradingMode::Executor,
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Executor("max_in_flight must be at least 1".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Executor("call_timeout_ms must be positive".into()));
        }
        if !self.failure_cost.is_finite() || self.failure_cost < 0.0 {
            return Err(ConfigError::Executor("failure_cost must be non-negative".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Genome space
// =============================================================================

/// A bounded continuous domain. `step` is the mutation scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloatRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// A bounded integer domain. Values are kept on the `min + k * step` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolDomain {
    #[default]
    Free,
    Fixed(bool),
}

/// Declared domain of every genome field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceConfig {
    pub temperature: FloatRange,
    pub top_p: FloatRange,
    pub model_keys: Vec<String>,
    pub prompt_variants: Vec<String>,
    pub chain_of_thought: BoolDomain,
    pub max_tokens: IntRange,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            temperature: FloatRange {
                min: 0.0,
                max: 2.0,
                step: 0.1,
            },
            top_p: FloatRange {
                min: 0.0,
                max: 1.0,
                step: 0.05,
            },
            model_keys: vec!["fast".into(), "balanced".into(), "large".into()],
            prompt_variants: vec!["baseline".into(), "concise".into(), "stepwise".into()],
            chain_of_thought: BoolDomain::Free,
            max_tokens: IntRange {
                min: 128,
                max: 2048,
                step: 128,
            },
        }
    }
}

impl SpaceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, range) in [("temperature", &self.temperature), ("top_p", &self.top_p)] {
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                return Err(ConfigError::Space(format!(
                    "{name} range [{}, {}] is empty or not finite",
                    range.min, range.max
                )));
            }
            if !range.step.is_finite() || range.step < 0.0 {
                return Err(ConfigError::Space(format!("{name} step must be non-negative")));
            }
        }
        if self.model_keys.is_empty() {
            return Err(ConfigError::Space("model_keys must not be empty".into()));
        }
        if self.prompt_variants.is_empty() {
            return Err(ConfigError::Space("prompt_variants must not be empty".into()));
        }
        if self.max_tokens.min > self.max_tokens.max {
            return Err(ConfigError::Space(format!(
                "max_tokens range [{}, {}] is empty",
                self.max_tokens.min, self.max_tokens.max
            )));
        }
        if self.max_tokens.step == 0 {
            return Err(ConfigError::Space("max_tokens step must be positive".into()));
        }
        if (self.max_tokens.max - self.max_tokens.min) / self.max_tokens.step == u32::MAX {
            return Err(ConfigError::Space(
                "max_tokens grid has more points than a u32 can index".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Bandit
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BanditConfig {
    /// Returned by `choose()` when no arm is deployed.
    pub default_genome_id: String,
    pub alpha0: f64,
    pub beta0: f64,
    /// Pseudo-observations granted from offline fitness on promotion.
    /// Zero installs every arm at the plain `(alpha0, beta0)` prior.
    pub warm_start_strength: f64,
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            default_genome_id: "baseline".to_string(),
            alpha0: 1.0,
            beta0: 1.0,
            warm_start_strength: 0.0,
            seed: None,
        }
    }
}

impl BanditConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha0 > 0.0 && self.alpha0.is_finite()) {
            return Err(ConfigError::Bandit("alpha0 must be positive".into()));
        }
        if !(self.beta0 > 0.0 && self.beta0.is_finite()) {
            return Err(ConfigError::Bandit("beta0 must be positive".into()));
        }
        if !self.warm_start_strength.is_finite() || self.warm_start_strength < 0.0 {
            return Err(ConfigError::Bandit("warm_start_strength must be non-negative".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Daemon
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Best production genomes copied into the seed population.
    pub incumbent_seeds: usize,
    /// Mutated variants generated per incumbent seed.
    pub incumbent_variants: usize,
    /// Wall-clock budget for the evolution phase.
    pub time_budget_secs: u64,
    /// Candidates failing more than this share of examples are never promoted.
    pub max_failure_rate: f64,
    /// Candidates scored below this by the reward model are discarded.
    pub reward_threshold: Option<f64>,
    /// Abort the run when no reward model is wired in.
    pub require_reward_model: bool,
    pub promote_top_k: usize,
    /// Margin the new best must beat the incumbent by to recommend deployment.
    pub deploy_margin: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            incumbent_seeds: 2,
            incumbent_variants: 2,
            time_budget_secs: 3600,
            max_failure_rate: 0.5,
            reward_threshold: None,
            require_reward_model: false,
            promote_top_k: 2,
            deploy_margin: 0.02,
        }
    }
}

impl DaemonConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(ConfigError::Daemon("max_failure_rate must be in [0, 1]".into()));
        }
        if let Some(threshold) = self.reward_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::Daemon("reward_threshold must be in [0, 1]".into()));
            }
        }
        if self.promote_top_k == 0 {
            return Err(ConfigError::Daemon("promote_top_k must be at least 1".into()));
        }
        if !self.deploy_margin.is_finite() || self.deploy_margin < 0.0 {
            return Err(ConfigError::Daemon("deploy_margin must be a non-negative number".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Paths and run-specific values loaded from environment variables.
/// Tuning knobs live in the TOML [`FileConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub dataset_path: PathBuf,
    pub bandit_state_path: PathBuf,
    pub sim_world_path: PathBuf,
    pub seed: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let seed = match std::env::var("GENETUNE_SEED") {
            Ok(raw) => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("GENETUNE_SEED must be an integer, got {raw:?}"))?,
            ),
            Err(_) => None,
        };

        let config = Self {
            config_path: env_path("GENETUNE_CONFIG", "config/genetune.toml"),
            dataset_path: env_path("GENETUNE_DATASET", "config/golden.json"),
            bandit_state_path: env_path("GENETUNE_BANDIT_STATE", "state/bandit.json"),
            sim_world_path: env_path("GENETUNE_SIM_WORLD", "config/sim_world.json"),
            seed,
        };

        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  GENETUNE_CONFIG: {}", self.config_path.display());
        tracing::info!("  GENETUNE_DATASET: {}", self.dataset_path.display());
        tracing::info!("  GENETUNE_BANDIT_STATE: {}", self.bandit_state_path.display());
        tracing::info!("  GENETUNE_SIM_WORLD: {}", self.sim_world_path.display());
        match self.seed {
            Some(seed) => tracing::info!("  GENETUNE_SEED: {seed}"),
            None => tracing::info!("  GENETUNE_SEED: <not set>"),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FileConfig::default();
        assert_eq!(config.evolution.population_size, 12);
        assert_eq!(config.evolution.survivors, 6);
        assert_eq!(config.evolution.eval_samples, 64);
        assert_eq!(config.evolution.crossover_prob, 0.3);
        assert_eq!(config.bandit.alpha0, 1.0);
        assert_eq!(config.bandit.beta0, 1.0);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            [evolution]
            population_size = 20
            survivors = 10

            [space]
            model_keys = ["small"]
            chain_of_thought = { fixed = true }

            [executor]
            grading = "normalized_match"
            "#,
        )
        .unwrap();
        assert_eq!(config.evolution.population_size, 20);
        assert_eq!(config.evolution.max_generations, 15);
        assert_eq!(config.space.model_keys, vec!["small".to_string()]);
        assert_eq!(config.space.chain_of_thought, BoolDomain::Fixed(true));
        assert_eq!(config.executor.grading, GradingMode::NormalizedMatch);
        assert_eq!(config.space.top_p.max, 1.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("[evolution]\npopulation = 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn survivors_above_population_is_invalid() {
        let config = EvolutionConfig {
            population_size: 4,
            survivors: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_generations_is_invalid() {
        let config = EvolutionConfig {
            max_generations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unindexable_token_grid_is_invalid() {
        let mut config = SpaceConfig::default();
        config.max_tokens = IntRange {
            min: 0,
            max: u32::MAX,
            step: 1,
        };
        assert!(config.validate().is_err());

        config.max_tokens.min = 1;
        config.validate().unwrap();
    }

    #[test]
    fn deploy_margin_must_be_a_non_negative_number() {
        for margin in [-0.1, f64::NAN, f64::INFINITY] {
            let config = DaemonConfig {
                deploy_margin: margin,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "margin {margin} accepted");
        }
    }

    #[test]
    fn incumbent_seeds_must_fit_the_population() {
        let mut config = FileConfig::default();
        config.evolution.population_size = 4;
        config.evolution.survivors = 2;
        config.daemon.incumbent_seeds = 2;
        config.daemon.incumbent_variants = 2;
        assert!(config.validate().is_err());

        config.daemon.incumbent_variants = 1;
        config.validate().unwrap();
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genetune.toml");
        std::fs::write(&path, "[bandit]\ndefault_genome_id = \"g-0\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.bandit.default_genome_id, "g-0");
    }

    #[test]
    fn load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genetune.toml");
        std::fs::write(&path, "[bandit]\nalpha0 = 0.0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
