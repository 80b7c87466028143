//! Storage engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};

/// Thresholds and tuning for the level manager.
///
/// Field names on the wire follow the `Storage*` option names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Buffered bytes before the write buffer is flushed to level 0.
    #[serde(rename = "StorageMemoryThreshold")]
    pub memory_threshold: u64,
    /// Shards a level may hold before it is compacted into the next one.
    #[serde(rename = "StorageShardThreshold")]
    pub shard_threshold: usize,
    /// Target shard size at level 0.
    #[serde(rename = "StorageLevelZeroSize")]
    pub level_zero_size: u64,
    /// Growth factor of the target shard size from one level to the next.
    #[serde(rename = "StorageLevelSizeBase")]
    pub level_size_base: u64,
    /// Number of levels; the last one is never compacted further.
    #[serde(rename = "StorageMaxLevels")]
    pub max_levels: usize,
    /// Size of a shard data block (the unit of lazy reads).
    #[serde(rename = "StorageBlockSize")]
    pub block_size: usize,
    /// Extra attempts for a failed segment write before giving up.
    #[serde(rename = "StorageMaxRetries")]
    pub max_retries: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    #[serde(rename = "StorageRetryBackoffMs")]
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_threshold: 64 * 1024 * 1024, // 64 MB
            shard_threshold: 10,
            level_zero_size: 1024 * 1024, // 1 MB
            level_size_base: 10,
            max_levels: 5,
            block_size: 4096,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

impl StorageConfig {
    /// Set the memory threshold.
    pub fn memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// Set the shard threshold.
    pub fn shard_threshold(mut self, count: usize) -> Self {
        self.shard_threshold = count;
        self
    }

    /// Set the level zero shard size.
    pub fn level_zero_size(mut self, bytes: u64) -> Self {
        self.level_zero_size = bytes;
        self
    }

    /// Set the number of levels.
    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the retry backoff.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    /// Target size of an output shard written into `level`.
    pub fn target_shard_size(&self, level: usize) -> u64 {
        let mut size = self.level_zero_size;
        for _ in 0..level {
            size = size.saturating_mul(self.level_size_base);
        }
        size
    }

    /// Cumulative bytes a level may hold before it is compacted.
    pub fn level_size_limit(&self, level: usize) -> u64 {
        self.target_shard_size(level)
            .saturating_mul(self.shard_threshold as u64)
    }

    /// Index of the deepest level.
    pub fn deepest_level(&self) -> usize {
        self.max_levels.saturating_sub(1)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> StorageResult<()> {
        if self.memory_threshold == 0 {
            return Err(StorageError::InvalidConfig(
                "StorageMemoryThreshold must be positive".into(),
            ));
        }
        if self.shard_threshold == 0 {
            return Err(StorageError::InvalidConfig(
                "StorageShardThreshold must be positive".into(),
            ));
        }
        if self.level_zero_size == 0 {
            return Err(StorageError::InvalidConfig(
                "StorageLevelZeroSize must be positive".into(),
            ));
        }
        if self.level_size_base < 1 {
            return Err(StorageError::InvalidConfig(
                "StorageLevelSizeBase must be at least 1".into(),
            ));
        }
        if self.max_levels < 2 {
            return Err(StorageError::InvalidConfig(
                "StorageMaxLevels must be at least 2".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(StorageError::InvalidConfig(
                "StorageBlockSize must be positive".into(),
            ));
        }
        Ok(())
    }
}
