//! Graders turn executor output into a correctness score in `[0, 1]`.

use std::sync::Arc;

use async_trait::async_trait;

use genetune_common::GradingMode;

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, output: &str, expected: &str) -> f64;
}

/// Grader for a configured mode. `None` means trust the executor's own score.
pub fn grader_for(mode: GradingMode) -> Option<Arc<dyn Grader>> {
    match mode {
        GradingMode::Executor => None,
        GradingMode::ExactMatch => Some(Arc::new(ExactMatch)),
        GradingMode::NormalizedMatch => Some(Arc::new(NormalizedMatch)),
        GradingMode::Contains => Some(Arc::new(Contains)),
    }
}

pub struct ExactMatch;

#[async_trait]
impl Grader for ExactMatch {
    async fn grade(&self, output: &str, expected: &str) -> f64 {
        if output.trim() == expected.trim() {
            1.0
        } else {
            0.0
        }
    }
}

/// Case-insensitive, whitespace-collapsed, trailing punctuation ignored.
pub struct NormalizedMatch;

#[async_trait]
impl Grader for NormalizedMatch {
    async fn grade(&self, output: &str, expected: &str) -> f64 {
        if normalize(output) == normalize(expected) {
            1.0
        } else {
            0.0
        }
    }
}

pub struct Contains;

#[async_trait]
impl Grader for Contains {
    async fn grade(&self, output: &str, expected: &str) -> f64 {
        let needle = normalize(expected);
        if !needle.is_empty() && normalize(output).contains(&needle) {
            1.0
        } else {
            0.0
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase()
}
