//! Storage layer error types
//!
//! All errors that can occur while reading, writing and compacting shards
//! are defined here. We use `thiserror` for ergonomic error definition.

use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::types::{InvalidPathError, ShardId};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error computing a content address
    #[error("content address error: {0}")]
    Hash(#[from] git2::Error),

    /// I/O error from the segment store
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// the segment store refused or failed a write; retried by the caller
    #[error("segment write failed: {0}")]
    SegmentWrite(String),

    /// the requested segment does not exist
    #[error("segment not found: {0}")]
    SegmentNotFound(ShardId),

    /// segment content does not decode or does not match its address
    #[error("corrupted shard {shard}: {reason}")]
    CorruptedShard { shard: ShardId, reason: String },

    /// invalid file path
    #[error("invalid path: {0}")]
    InvalidPath(#[from] InvalidPathError),

    /// invalid storage configuration
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// flush or compaction gave up after its retry budget
    #[error("{operation} failed after {attempts} attempts: {source}")]
    CompactionFailure {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    /// a whole-file read asked for more bytes than can be held in memory
    #[error("file {path} is too large to read whole ({size} bytes)")]
    FileTooLarge { path: String, size: u64 },

    /// the level manager was closed because its repo was deleted
    #[error("storage for repo {0} is closed")]
    Closed(String),
}

impl StorageError {
    pub fn corrupted(shard: ShardId, reason: impl Into<String>) -> Self {
        StorageError::CorruptedShard {
            shard,
            reason: reason.into(),
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::SegmentNotFound(_))
    }

    /// check if this error is transient and worth another attempt
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::SegmentWrite(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::SegmentNotFound(_) => ErrorKind::NotFound,
            StorageError::InvalidPath(_)
            | StorageError::InvalidConfig(_)
            | StorageError::FileTooLarge { .. } => ErrorKind::InvalidArgument,
            StorageError::CompactionFailure { .. } => ErrorKind::CompactionFailure,
            StorageError::Hash(_)
            | StorageError::Io(_)
            | StorageError::SegmentWrite(_)
            | StorageError::CorruptedShard { .. }
            | StorageError::Closed(_) => ErrorKind::Io,
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
