use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Genome
// =============================================================================

/// The tunable generation parameters carried by a genome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeParams {
    pub temperature: f64,
    pub top_p: f64,
    pub model_key: String,
    pub prompt_variant_id: String,
    pub use_chain_of_thought: bool,
    pub max_tokens: u32,
}

/// One field of [`GenomeParams`]. Genetic operators work gene by gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gene {
    Temperature,
    TopP,
    ModelKey,
    PromptVariant,
    ChainOfThought,
    MaxTokens,
}

impl Gene {
    pub const ALL: [Gene; 6] = [
        Gene::Temperature,
        Gene::TopP,
        Gene::ModelKey,
        Gene::PromptVariant,
        Gene::ChainOfThought,
        Gene::MaxTokens,
    ];

    /// Continuous genes are the only ones eligible for midpoint crossover.
    pub fn is_continuous(self) -> bool {
        matches!(self, Gene::Temperature | Gene::TopP)
    }
}

impl fmt::Display for Gene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::TopP => write!(f, "top_p"),
            Self::ModelKey => write!(f, "model_key"),
            Self::PromptVariant => write!(f, "prompt_variant_id"),
            Self::ChainOfThought => write!(f, "use_chain_of_thought"),
            Self::MaxTokens => write!(f, "max_tokens"),
        }
    }
}

/// A single field that differs between two genomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamChange {
    pub field: Gene,
    pub from: String,
    pub to: String,
}

impl GenomeParams {
    /// Render one gene's value for reports and diffs.
    pub fn value_of(&self, gene: Gene) -> String {
        match gene {
            Gene::Temperature => format!("{:.3}", self.temperature),
            Gene::TopP => format!("{:.3}", self.top_p),
            Gene::ModelKey => self.model_key.clone(),
            Gene::PromptVariant => self.prompt_variant_id.clone(),
            Gene::ChainOfThought => self.use_chain_of_thought.to_string(),
            Gene::MaxTokens => self.max_tokens.to_string(),
        }
    }

    /// Copy a single gene from `other` into `self`.
    pub fn inherit(&mut self, gene: Gene, other: &GenomeParams) {
        match gene {
            Gene::Temperature => self.temperature = other.temperature,
            Gene::TopP => self.top_p = other.top_p,
            Gene::ModelKey => self.model_key = other.model_key.clone(),
            Gene::PromptVariant => self.prompt_variant_id = other.prompt_variant_id.clone(),
            Gene::ChainOfThought => self.use_chain_of_thought = other.use_chain_of_thought,
            Gene::MaxTokens => self.max_tokens = other.max_tokens,
        }
    }

    /// Fields that changed going from `previous` to `self`.
    pub fn diff(&self, previous: &GenomeParams) -> Vec<ParamChange> {
        Gene::ALL
            .iter()
            .filter_map(|&gene| {
                let from = previous.value_of(gene);
                let to = self.value_of(gene);
                (from != to).then_some(ParamChange {
                    field: gene,
                    from,
                    to,
                })
            })
            .collect()
    }
}

/// A concrete configuration point in the tunable parameter space.
///
/// The parameter block is private so that every change goes through
/// [`Genome::set_params`] / [`Genome::update_params`], which drop the cached
/// fitness. Domain validity is enforced by the optimizer's genome space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub id: String,
    pub generation: u32,
    /// Lineage: zero (seeded), one (mutation) or two (crossover) parent ids.
    pub parents: Vec<String>,
    pub created_at: DateTime<Utc>,
    params: GenomeParams,
    fitness: Option<FitnessScore>,
}

impl Genome {
    /// A fresh genome with no lineage.
    pub fn new(params: GenomeParams, generation: u32) -> Self {
        Self::child(params, generation, Vec::new())
    }

    /// An offspring genome produced from `parents`.
    pub fn child(params: GenomeParams, generation: u32, parents: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            generation,
            parents,
            created_at: Utc::now(),
            params,
            fitness: None,
        }
    }

    pub fn params(&self) -> &GenomeParams {
        &self.params
    }

    /// Replace the parameters. The cached fitness is invalidated if anything changed.
    pub fn set_params(&mut self, params: GenomeParams) {
        if self.params != params {
            self.params = params;
            self.fitness = None;
        }
    }

    /// Edit the parameters in place; same invalidation rule as [`Genome::set_params`].
    pub fn update_params(&mut self, edit: impl FnOnce(&mut GenomeParams)) {
        let mut params = self.params.clone();
        edit(&mut params);
        self.set_params(params);
    }

    pub fn fitness(&self) -> Option<&FitnessScore> {
        self.fitness.as_ref()
    }

    pub fn fitness_total(&self) -> Option<f64> {
        self.fitness.as_ref().map(|f| f.total)
    }

    pub fn set_fitness(&mut self, fitness: FitnessScore) {
        self.fitness = Some(fitness);
    }

    pub fn clear_fitness(&mut self) {
        self.fitness = None;
    }
}

// =============================================================================
// Fitness
// =============================================================================

/// Aggregate multi-objective score for one genome on one example subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessScore {
    /// Weighted scalar used for ranking. Higher is better.
    pub total: f64,
    pub correctness: f64,
    pub latency_ms: f64,
    pub tokens_used: f64,
    pub repair_rate: f64,
    pub cost: f64,
    /// Share of examples whose executor retries were exhausted.
    pub failure_rate: f64,
    pub examples: usize,
    /// Which example subset produced this score. Scores from different
    /// epochs are not comparable.
    pub sample_epoch: u32,
    pub evaluated_at: DateTime<Utc>,
}

// =============================================================================
// Golden data and evaluation results
// =============================================================================

/// A curated example used to evaluate fitness. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenExample {
    pub id: String,
    pub input: String,
    /// Expected answer or grading rubric.
    pub expected: String,
    #[serde(default)]
    pub category: String,
}

/// Outcome of running one genome against one example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub genome_id: String,
    pub example_id: String,
    pub correctness: f64,
    pub latency_ms: u64,
    pub tokens_used: u32,
    pub repaired: bool,
    pub cost: f64,
    /// Executor retries were exhausted; the other fields hold the penalty.
    pub failed: bool,
}
