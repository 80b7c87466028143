//! storage layer for ShardFS
//!
//! this module turns buffered file writes into immutable, content-addressed
//! shards and keeps the shard count bounded by leveled compaction. The upper
//! layers (commit graph, mount adapter) use this API and never touch shard
//! bytes or the segment store directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LevelManager                           │
//! │   (one per repo: put, flush, compact, read, list, verify)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │   buffer    │       │ compaction  │       │   resolve   │
//!  │  (writes)   │       │  (merging)  │       │   (reads)   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │                     │
//!         └─────────────────────┼─────────────────────┘
//!                               │
//!                               ▼
//!                 ┌───────────────────────────┐
//!                 │   shard  +  merge         │
//!                 │ (format, lazy k-way scan) │
//!                 └───────────────────────────┘
//!                               │
//!                               ▼
//!                        ┌─────────────┐
//!                        │   segment   │
//!                        │ (blob store)│
//!                        └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use shardfs::storage::{CommitId, LevelManager, MemorySegmentStore, StorageConfig};
//!
//! let store = Arc::new(MemorySegmentStore::new());
//! let storage = LevelManager::new("images", StorageConfig::default(), store)?;
//!
//! // buffer a write, then push it into a level-0 shard
//! let commit = CommitId::generate();
//! storage.put_data("/cat.png", commit, 0, bytes)?;
//! storage.flush()?;
//!
//! // read back through the commit's lineage
//! let content = storage.read_file("/cat.png", &[commit])?;
//! ```

mod buffer;
mod compaction;
mod config;
mod error;
mod levels;
mod merge;
mod resolve;
mod segment;
mod shard;
mod types;

// Re-export public API
pub use compaction::CompactionResult;
pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use levels::{LevelManager, LevelSet, LevelStats, StorageStats, VerifyReport};
pub use resolve::{resolve_group, FileView, Resolved};
pub use segment::{FsSegmentStore, MemorySegmentStore, SegmentStore};
pub use shard::{ShardIter, ShardMeta};
pub use types::{
    normalize_path, normalize_prefix, CommitId, Entry, EntryKey, EntryKind, GroupKey,
    InvalidPathError, PathRange, Payload, ShardId,
};
