//! Commit graph error types.

use thiserror::Error;

use crate::error::ErrorKind;
use crate::pfs::types::InvalidNameError;
use crate::storage::{CommitId, InvalidPathError, StorageError};

/// Result type for repo, commit and file operations.
pub type PfsResult<T> = Result<T, PfsError>;

/// Errors returned by the commit/branch graph and the file API.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("repo not found: {0}")]
    RepoNotFound(String),

    #[error("repo already exists: {0}")]
    RepoExists(String),

    #[error("commit {commit} not found in repo {repo}")]
    CommitNotFound { repo: String, commit: String },

    #[error("branch {branch} not found in repo {repo}")]
    BranchNotFound { repo: String, branch: String },

    #[error("branch {branch} already exists in repo {repo}")]
    BranchExists { repo: String, branch: String },

    #[error("file {path} not found in commit {commit}")]
    FileNotFound { commit: CommitId, path: String },

    /// The requested parent is not a commit of the repo.
    #[error("invalid parent {parent} for a commit in repo {repo}")]
    InvalidParent { repo: String, parent: String },

    /// Write to, or finish of, a commit that is already finished.
    #[error("commit {0} is not open")]
    NotOpen(CommitId),

    /// Another handle already has the path open for writing.
    #[error("{path} is already open for writing in commit {commit}")]
    ConcurrentWriter { commit: CommitId, path: String },

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] InvalidPathError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl PfsError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PfsError::RepoNotFound(_)
                | PfsError::CommitNotFound { .. }
                | PfsError::BranchNotFound { .. }
                | PfsError::FileNotFound { .. }
        ) || matches!(self, PfsError::Storage(e) if e.is_not_found())
    }

    /// check if this error is a conflict with another writer or an earlier finish
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PfsError::ConcurrentWriter { .. }
                | PfsError::NotOpen(_)
                | PfsError::RepoExists(_)
                | PfsError::BranchExists { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PfsError::Storage(e) => e.kind(),
            PfsError::RepoNotFound(_)
            | PfsError::CommitNotFound { .. }
            | PfsError::BranchNotFound { .. }
            | PfsError::FileNotFound { .. } => ErrorKind::NotFound,
            PfsError::RepoExists(_) | PfsError::BranchExists { .. } => ErrorKind::AlreadyExists,
            PfsError::NotOpen(_) => ErrorKind::AlreadyFinished,
            PfsError::ConcurrentWriter { .. } => ErrorKind::ConcurrentWriterConflict,
            PfsError::InvalidParent { .. }
            | PfsError::InvalidName(_)
            | PfsError::InvalidPath(_)
            | PfsError::InvalidConfig(_)
            | PfsError::ConfigParse(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let commit = CommitId::generate();
        assert_eq!(PfsError::NotOpen(commit).kind(), ErrorKind::AlreadyFinished);
        assert!(PfsError::NotOpen(commit).is_conflict());

        let missing = PfsError::RepoNotFound("images".to_string());
        assert!(missing.is_not_found());
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let writer = PfsError::ConcurrentWriter {
            commit,
            path: "/a".to_string(),
        };
        assert_eq!(writer.kind(), ErrorKind::ConcurrentWriterConflict);

        let storage = PfsError::from(StorageError::SegmentWrite("disk".to_string()));
        assert_eq!(storage.kind(), ErrorKind::Io);
        assert!(!storage.is_not_found());
    }
}
