//! Simulated backend world: response surfaces for every model and prompt variant.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use genetune_common::GenomeParams;

/// Everything the simulated executor knows about the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimWorld {
    pub name: String,
    pub models: BTreeMap<String, ModelProfile>,
    pub prompt_variants: BTreeMap<String, PromptProfile>,
    #[serde(default)]
    pub chain_of_thought: PromptProfile,
    /// Probability that a call fails transiently (429, reset, ...).
    #[serde(default)]
    pub transient_failure_rate: f64,
    /// Probability that an answer comes back malformed and needs repair.
    #[serde(default)]
    pub malformed_rate: f64,
}

/// How one model responds to sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub base_accuracy: f64,
    pub optimal_temperature: f64,
    /// Accuracy lost per squared unit of distance from the optimal temperature.
    pub temperature_sensitivity: f64,
    pub optimal_top_p: f64,
    pub top_p_sensitivity: f64,
    /// Tokens an untruncated answer needs.
    pub typical_tokens: u32,
    pub latency_ms_base: u64,
    pub latency_ms_per_token: f64,
    pub cost_per_1k_tokens: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptProfile {
    #[serde(default)]
    pub accuracy_bonus: f64,
    /// Scales the answer length. Zero is treated as one.
    #[serde(default)]
    pub token_multiplier: f64,
}

impl PromptProfile {
    fn multiplier(&self) -> f64 {
        if self.token_multiplier > 0.0 {
            self.token_multiplier
        } else {
            1.0
        }
    }
}

/// Expected behaviour of one parameter combination, before per-call noise.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseProfile {
    pub accuracy: f64,
    pub tokens_used: u32,
    pub truncated: bool,
    pub latency_ms: u64,
    pub cost: f64,
}

impl SimWorld {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sim world: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sim world: {}", path.display()))
    }

    /// `None` when the model key is not part of this world.
    pub fn respond(&self, params: &GenomeParams) -> Option<ResponseProfile> {
        let model = self.models.get(&params.model_key)?;
        let variant = self
            .prompt_variants
            .get(&params.prompt_variant_id)
            .cloned()
            .unwrap_or_default();

        let mut accuracy = model.base_accuracy
            - model.temperature_sensitivity * (params.temperature - model.optimal_temperature).powi(2)
            - model.top_p_sensitivity * (params.top_p - model.optimal_top_p).powi(2)
            + variant.accuracy_bonus;
        let mut wanted = model.typical_tokens as f64 * variant.multiplier();
        if params.use_chain_of_thought {
            accuracy += self.chain_of_thought.accuracy_bonus;
            wanted *= self.chain_of_thought.multiplier();
        }

        let wanted = wanted.round().max(1.0) as u32;
        let truncated = wanted > params.max_tokens;
        let tokens_used = wanted.min(params.max_tokens);
        if truncated {
            // A cut-off answer is only right if the cut missed the answer.
            accuracy *= tokens_used as f64 / wanted as f64;
        }

        Some(ResponseProfile {
            accuracy: accuracy.clamp(0.0, 1.0),
            tokens_used,
            truncated,
            latency_ms: model.latency_ms_base
                + (model.latency_ms_per_token * tokens_used as f64).round() as u64,
            cost: tokens_used as f64 / 1000.0 * model.cost_per_1k_tokens,
        })
    }
}

impl Default for SimWorld {
    /// Three models and three prompt variants, matching the default genome space.
    fn default() -> Self {
        let models = [
            ("fast", 0.62, 0.3, 0.8, 0.9, 0.3, 180, 120, 2.0, 0.0005),
            ("balanced", 0.74, 0.5, 0.6, 0.9, 0.4, 260, 200, 4.0, 0.002),
            ("large", 0.86, 0.7, 0.5, 0.95, 0.5, 340, 400, 9.0, 0.01),
        ]
        .into_iter()
        .map(|(key, base, temp, temp_sens, top_p, top_p_sens, tokens, latency, per_token, cost)| {
            (
                key.to_string(),
                ModelProfile {
                    base_accuracy: base,
                    optimal_temperature: temp,
                    temperature_sensitivity: temp_sens,
                    optimal_top_p: top_p,
                    top_p_sensitivity: top_p_sens,
                    typical_tokens: tokens,
                    latency_ms_base: latency,
                    latency_ms_per_token: per_token,
                    cost_per_1k_tokens: cost,
                },
            )
        })
        .collect();

        let prompt_variants = [
            ("baseline", 0.0, 1.0),
            ("concise", -0.02, 0.6),
            ("stepwise", 0.04, 1.5),
        ]
        .into_iter()
        .map(|(key, bonus, multiplier)| {
            (
                key.to_string(),
                PromptProfile {
                    accuracy_bonus: bonus,
                    token_multiplier: multiplier,
                },
            )
        })
        .collect();

        Self {
            name: "default".to_string(),
            models,
            prompt_variants,
            chain_of_thought: PromptProfile {
                accuracy_bonus: 0.05,
                token_multiplier: 1.8,
            },
            transient_failure_rate: 0.02,
            malformed_rate: 0.03,
        }
    }
}
