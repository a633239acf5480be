//! Typed errors for the optimizer.

use thiserror::Error;

use genetune_common::ConfigError;

/// Errors that end an evolution run before it starts.
#[derive(Debug, Error)]
pub enum EvolveError {
    /// Evolution, executor or space configuration rejected
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// Nothing to evaluate against
    #[error("golden dataset is empty")]
    EmptyDataset,
}

/// A parameter combination outside the declared domain.
///
/// Only produced by [`crate::GenomeSpace::validate`]; everywhere else the
/// space repairs genomes instead of failing.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("genome outside declared domain: {}", .violations.join("; "))]
pub struct GenomeValidationError {
    pub violations: Vec<String>,
}
