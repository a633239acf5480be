//! JSON file persistence for the arm table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use genetune_common::BanditConfig;

use crate::bandit::{BanditSnapshot, ThompsonBandit};
use crate::error::BanditError;

#[derive(Debug, Clone)]
pub struct BanditStore {
    path: PathBuf,
}

impl BanditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no state has been saved yet.
    pub fn load(&self) -> Result<Option<BanditSnapshot>, BanditError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BanditError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })
    }

    /// Write to a sibling temp file, then rename over the old state, so a
    /// crash never leaves a half-written snapshot behind.
    pub fn save(&self, snapshot: &BanditSnapshot) -> Result<(), BanditError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| BanditError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Load the saved bandit, or start an empty one from `config`.
    pub fn open(&self, config: &BanditConfig) -> Result<ThompsonBandit> {
        match self.load()? {
            Some(snapshot) => {
                info!(
                    path = %self.path.display(),
                    arms = snapshot.arms.len(),
                    "Loaded bandit state"
                );
                Ok(ThompsonBandit::from_snapshot(snapshot, config.seed))
            }
            None => {
                info!(path = %self.path.display(), "No bandit state yet, starting empty");
                ThompsonBandit::new(config).context("Invalid bandit config")
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> BanditError {
        BanditError::Store {
            path: self.path.display().to_string(),
            source,
        }
    }
}
