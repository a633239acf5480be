//! Golden dataset sources.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use genetune_common::GoldenExample;

#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load(&self) -> Result<Vec<GoldenExample>>;
}

/// A JSON array of golden examples on disk.
#[derive(Debug, Clone)]
pub struct JsonDataset {
    path: PathBuf,
}

impl JsonDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatasetSource for JsonDataset {
    async fn load(&self) -> Result<Vec<GoldenExample>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read golden dataset: {}", self.path.display()))?;
        let examples: Vec<GoldenExample> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse golden dataset: {}", self.path.display()))?;
        check_ids(&examples)
            .with_context(|| format!("Invalid golden dataset: {}", self.path.display()))?;
        Ok(examples)
    }
}

/// In-memory examples.
#[derive(Debug, Clone, Default)]
pub struct StaticDataset(pub Vec<GoldenExample>);

#[async_trait]
impl DatasetSource for StaticDataset {
    async fn load(&self) -> Result<Vec<GoldenExample>> {
        check_ids(&self.0)?;
        Ok(self.0.clone())
    }
}

fn check_ids(examples: &[GoldenExample]) -> Result<()> {
    let mut seen = HashSet::new();
    for example in examples {
        if example.id.trim().is_empty() {
            bail!("golden example with empty id");
        }
        if !seen.insert(example.id.as_str()) {
            bail!("duplicate golden example id {}", example.id);
        }
    }
    Ok(())
}
