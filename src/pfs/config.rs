//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pfs::error::{PfsError, PfsResult};
use crate::storage::StorageConfig;

/// How the mount adapter enforces sequential writes into open commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeekPolicyConfig {
    /// pick by platform capability
    #[default]
    Auto,
    /// reject non-append seeks and writes when they happen
    DenyNonAppend,
    /// allow them and validate the write pattern on close
    Deferred,
}

/// Configuration of a [`Pfs`](crate::pfs::Pfs) instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PfsConfig {
    /// Storage engine thresholds.
    #[serde(flatten)]
    pub storage: StorageConfig,
    /// Seek enforcement for open-for-write handles.
    pub seek_policy: SeekPolicyConfig,
    /// Directory for segment files. Segments stay in memory when unset.
    pub data_dir: Option<PathBuf>,
}

impl PfsConfig {
    /// Create a configuration persisting segments under `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(path.into()),
            ..Default::default()
        }
    }

    /// Create a configuration keeping segments in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> PfsResult<Self> {
        let config: PfsConfig = serde_json::from_str(json)?;
        config
            .storage
            .validate()
            .map_err(|e| PfsError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Set storage thresholds.
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set the seek policy.
    pub fn seek_policy(mut self, policy: SeekPolicyConfig) -> Self {
        self.seek_policy = policy;
        self
    }
}
