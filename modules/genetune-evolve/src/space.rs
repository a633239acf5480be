//! GenomeSpace: the declared parameter domain.
//!
//! Every genome that enters a population (seeded, bred, or handed in from
//! outside) passes through [`GenomeSpace::repair`], which is the single place
//! the domain invariant is enforced.

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

use genetune_common::{
    BoolDomain, ConfigError, FloatRange, Gene, Genome, GenomeParams, IntRange, SpaceConfig,
};

use crate::error::GenomeValidationError;

/// Gaussian perturbations are cut off at this many steps.
const MAX_STEP_MULTIPLE: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct GenomeSpace {
    config: SpaceConfig,
}

impl GenomeSpace {
    pub fn new(config: SpaceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Genes whose domain holds more than one value. Mutation only touches these.
    pub fn tunable_genes(&self) -> Vec<Gene> {
        let c = &self.config;
        Gene::ALL
            .iter()
            .copied()
            .filter(|gene| match gene {
                Gene::Temperature => c.temperature.max > c.temperature.min,
                Gene::TopP => c.top_p.max > c.top_p.min,
                Gene::ModelKey => c.model_keys.len() > 1,
                Gene::PromptVariant => c.prompt_variants.len() > 1,
                Gene::ChainOfThought => c.chain_of_thought == BoolDomain::Free,
                Gene::MaxTokens => grid_len(&c.max_tokens) > 1,
            })
            .collect()
    }

    /// Check every field against its domain, reporting all violations.
    pub fn validate(&self, params: &GenomeParams) -> Result<(), GenomeValidationError> {
        let c = &self.config;
        let mut violations = Vec::new();

        for (gene, value, range) in [
            (Gene::Temperature, params.temperature, &c.temperature),
            (Gene::TopP, params.top_p, &c.top_p),
        ] {
            if !value.is_finite() || value < range.min || value > range.max {
                violations.push(format!(
                    "{gene}={value} not in [{}, {}]",
                    range.min, range.max
                ));
            }
        }
        if !c.model_keys.contains(&params.model_key) {
            violations.push(format!("model_key={} is not registered", params.model_key));
        }
        if !c.prompt_variants.contains(&params.prompt_variant_id) {
            violations.push(format!(
                "prompt_variant_id={} is not registered",
                params.prompt_variant_id
            ));
        }
        if let BoolDomain::Fixed(expected) = c.chain_of_thought {
            if params.use_chain_of_thought != expected {
                violations.push(format!("use_chain_of_thought must be {expected}"));
            }
        }
        if !on_grid(params.max_tokens, &c.max_tokens) {
            violations.push(format!(
                "max_tokens={} not on grid {}..={} step {}",
                params.max_tokens, c.max_tokens.min, c.max_tokens.max, c.max_tokens.step
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(GenomeValidationError { violations })
        }
    }

    /// Bring a genome back inside the domain. Fitness is dropped if anything changed.
    pub fn repair<R: Rng>(&self, mut genome: Genome, rng: &mut R) -> Genome {
        let mut params = genome.params().clone();
        let repaired = self.repair_params(&mut params, rng);
        if !repaired.is_empty() {
            debug!(genome_id = genome.id.as_str(), fields = ?repaired, "Repaired out-of-domain genome");
            genome.set_params(params);
        }
        genome
    }

    /// Repair in place, returning the genes that had to change.
    pub fn repair_params<R: Rng>(&self, params: &mut GenomeParams, rng: &mut R) -> Vec<Gene> {
        let c = &self.config;
        let mut repaired = Vec::new();

        if let Some(v) = repair_float(params.temperature, &c.temperature, rng) {
            params.temperature = v;
            repaired.push(Gene::Temperature);
        }
        if let Some(v) = repair_float(params.top_p, &c.top_p, rng) {
            params.top_p = v;
            repaired.push(Gene::TopP);
        }
        if !c.model_keys.contains(&params.model_key) {
            params.model_key = pick(&c.model_keys, rng);
            repaired.push(Gene::ModelKey);
        }
        if !c.prompt_variants.contains(&params.prompt_variant_id) {
            params.prompt_variant_id = pick(&c.prompt_variants, rng);
            repaired.push(Gene::PromptVariant);
        }
        if let BoolDomain::Fixed(expected) = c.chain_of_thought {
            if params.use_chain_of_thought != expected {
                params.use_chain_of_thought = expected;
                repaired.push(Gene::ChainOfThought);
            }
        }
        if !on_grid(params.max_tokens, &c.max_tokens) {
            params.max_tokens = grid_value(&c.max_tokens, grid_index(params.max_tokens, &c.max_tokens));
            repaired.push(Gene::MaxTokens);
        }

        repaired
    }

    /// One independent uniform draw per field.
    pub fn sample<R: Rng>(&self, generation: u32, rng: &mut R) -> Genome {
        let c = &self.config;
        let params = GenomeParams {
            temperature: uniform_float(&c.temperature, rng),
            top_p: uniform_float(&c.top_p, rng),
            model_key: pick(&c.model_keys, rng),
            prompt_variant_id: pick(&c.prompt_variants, rng),
            use_chain_of_thought: match c.chain_of_thought {
                BoolDomain::Free => rng.random_bool(0.5),
                BoolDomain::Fixed(value) => value,
            },
            max_tokens: grid_value(&c.max_tokens, rng.random_range(0..grid_len(&c.max_tokens))),
        };
        self.repair(Genome::new(params, generation), rng)
    }

    /// Stratified seeding.
    ///
    /// Numeric fields get one draw per stratum (Latin hypercube); categorical and
    /// boolean fields cycle through every value whenever `n` is large enough to
    /// cover them, so each category appears at least once.
    pub fn seed_population<R: Rng>(&self, n: usize, generation: u32, rng: &mut R) -> Vec<Genome> {
        if n == 0 {
            return Vec::new();
        }
        let c = &self.config;

        let temperatures = stratified_floats(&c.temperature, n, rng);
        let top_ps = stratified_floats(&c.top_p, n, rng);
        let token_indices = stratified_indices(grid_len(&c.max_tokens), n, rng);
        let models = covering(&c.model_keys, n, rng);
        let variants = covering(&c.prompt_variants, n, rng);
        let cot: Vec<bool> = match c.chain_of_thought {
            BoolDomain::Free => covering(&[false, true], n, rng),
            BoolDomain::Fixed(value) => vec![value; n],
        };

        (0..n)
            .map(|i| {
                let params = GenomeParams {
                    temperature: temperatures[i],
                    top_p: top_ps[i],
                    model_key: models[i].clone(),
                    prompt_variant_id: variants[i].clone(),
                    use_chain_of_thought: cot[i],
                    max_tokens: grid_value(&c.max_tokens, token_indices[i]),
                };
                self.repair(Genome::new(params, generation), rng)
            })
            .collect()
    }

    /// Perturb a single gene: bounded Gaussian delta for numeric fields, flip
    /// for booleans, resample to a different value for categoricals.
    pub fn mutate_gene<R: Rng>(&self, params: &mut GenomeParams, gene: Gene, rng: &mut R) {
        let c = &self.config;
        match gene {
            Gene::Temperature => {
                params.temperature = perturb_float(params.temperature, &c.temperature, rng)
            }
            Gene::TopP => params.top_p = perturb_float(params.top_p, &c.top_p, rng),
            Gene::ModelKey => {
                params.model_key = pick_other(&c.model_keys, &params.model_key, rng)
            }
            Gene::PromptVariant => {
                params.prompt_variant_id =
                    pick_other(&c.prompt_variants, &params.prompt_variant_id, rng)
            }
            Gene::ChainOfThought => {
                if c.chain_of_thought == BoolDomain::Free {
                    params.use_chain_of_thought = !params.use_chain_of_thought;
                }
            }
            Gene::MaxTokens => params.max_tokens = perturb_int(params.max_tokens, &c.max_tokens, rng),
        }
    }
}

// --- continuous ---

fn uniform_float<R: Rng>(range: &FloatRange, rng: &mut R) -> f64 {
    if range.max > range.min {
        rng.random_range(range.min..=range.max)
    } else {
        range.min
    }
}

fn repair_float<R: Rng>(value: f64, range: &FloatRange, rng: &mut R) -> Option<f64> {
    if !value.is_finite() {
        return Some(uniform_float(range, rng));
    }
    let clamped = value.clamp(range.min, range.max);
    (clamped != value).then_some(clamped)
}

fn stratified_floats<R: Rng>(range: &FloatRange, n: usize, rng: &mut R) -> Vec<f64> {
    let width = range.max - range.min;
    let mut values: Vec<f64> = (0..n)
        .map(|i| {
            let u: f64 = rng.random();
            (range.min + (i as f64 + u) / n as f64 * width).min(range.max)
        })
        .collect();
    values.shuffle(rng);
    values
}

fn gaussian_delta<R: Rng>(step: f64, rng: &mut R) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    z.clamp(-MAX_STEP_MULTIPLE, MAX_STEP_MULTIPLE) * step
}

/// Pushes that would stick at a bound go the other way instead.
fn perturb_float<R: Rng>(value: f64, range: &FloatRange, rng: &mut R) -> f64 {
    let delta = gaussian_delta(range.step, rng);
    let pushed = (value + delta).clamp(range.min, range.max);
    if pushed == value {
        (value - delta).clamp(range.min, range.max)
    } else {
        pushed
    }
}

// --- integer grid ---

fn grid_len(range: &IntRange) -> u32 {
    ((range.max - range.min) / range.step).saturating_add(1)
}

fn grid_value(range: &IntRange, index: u32) -> u32 {
    range.min + index.min(grid_len(range) - 1) * range.step
}

fn grid_index(value: u32, range: &IntRange) -> u32 {
    let offset = value.saturating_sub(range.min) as f64 / range.step as f64;
    (offset.round() as u32).min(grid_len(range) - 1)
}

fn on_grid(value: u32, range: &IntRange) -> bool {
    value >= range.min
        && value <= grid_value(range, grid_len(range) - 1)
        && (value - range.min) % range.step == 0
}

fn stratified_indices<R: Rng>(len: u32, n: usize, rng: &mut R) -> Vec<u32> {
    let mut indices: Vec<u32> = (0..n)
        .map(|i| {
            let u: f64 = rng.random();
            let position = (i as f64 + u) / n as f64 * len as f64;
            (position.floor() as u32).min(len - 1)
        })
        .collect();
    indices.shuffle(rng);
    indices
}

fn perturb_int<R: Rng>(value: u32, range: &IntRange, rng: &mut R) -> u32 {
    let len = grid_len(range);
    if len < 2 {
        return range.min;
    }
    let mut delta = gaussian_delta(1.0, rng).round() as i64;
    if delta == 0 {
        delta = if rng.random_bool(0.5) { 1 } else { -1 };
    }
    let current = grid_index(value, range) as i64;
    let mut index = (current + delta).clamp(0, len as i64 - 1);
    if index == current {
        index = (current - delta).clamp(0, len as i64 - 1);
    }
    grid_value(range, index as u32)
}

// --- categorical ---

fn pick<T: Clone + Default, R: Rng>(values: &[T], rng: &mut R) -> T {
    // Domains are validated non-empty at construction.
    values.choose(rng).cloned().unwrap_or_default()
}

fn pick_other<R: Rng>(values: &[String], current: &str, rng: &mut R) -> String {
    let others: Vec<&String> = values.iter().filter(|v| v.as_str() != current).collect();
    match others.choose(rng) {
        Some(value) => (*value).clone(),
        None => current.to_string(),
    }
}

/// `n` values covering the whole set when `n >= values.len()`, shuffled.
fn covering<T: Clone, R: Rng>(values: &[T], n: usize, rng: &mut R) -> Vec<T> {
    let mut out: Vec<T> = if n >= values.len() {
        (0..n).map(|i| values[i % values.len()].clone()).collect()
    } else {
        values.choose_multiple(rng, n).cloned().collect()
    };
    out.shuffle(rng);
    out
}
