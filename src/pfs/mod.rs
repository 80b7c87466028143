//! Repos, commits and branches on top of the storage engine.
//!
//! A repo is a set of commits linked by parent pointers, plus named
//! branches pointing into that graph. Files are written into open commits
//! and become immutable when the commit finishes. Reading a file in a
//! commit walks the commit's lineage, so a child sees everything its
//! ancestors wrote unless it overwrote or deleted it.

mod api;
mod config;
mod error;
mod graph;
mod types;

pub use api::Pfs;
pub use config::{PfsConfig, SeekPolicyConfig};
pub use error::{PfsError, PfsResult};
pub use graph::{CommitRecord, RepoGraph};
pub use types::{BranchName, CommitInfo, CommitState, FileInfo, InvalidNameError, RepoInfo, RepoName};
