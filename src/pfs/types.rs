//! Names and records of the versioning model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::CommitId;

/// A validated repo name.
///
/// Rules:
/// - 1 to 64 characters
/// - ASCII letters, digits, `_`, `-` and `.`
/// - must start with a letter or digit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoName(String);

impl RepoName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RepoName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated branch name. Same rules as repo names, without `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchName(String);

impl BranchName {
    /// the default branch name
    pub const MASTER: &'static str = "master";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_name(&name)?;
        if name.contains("..") {
            return Err(InvalidNameError::InvalidCharacter { char: '.', position: 0 });
        }
        Ok(Self(name))
    }

    /// the default branch
    pub fn master() -> Self {
        Self(Self::MASTER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if name.len() > 64 {
        return Err(InvalidNameError::TooLong(name.len()));
    }
    if let Some(first) = name.chars().next() {
        if !first.is_ascii_alphanumeric() {
            return Err(InvalidNameError::InvalidStart(first));
        }
    }
    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }
    Ok(())
}

/// error type for invalid repo or branch names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// Lifecycle of a commit. OPEN → FINISHED happens exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitState {
    Open,
    Finished,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitState::Open => write!(f, "OPEN"),
            CommitState::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Metadata record of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: CommitId,
    pub repo: RepoName,
    pub parent: Option<CommitId>,
    /// branch the commit was started on, if any
    pub branch: Option<BranchName>,
    pub state: CommitState,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    /// bytes written under this commit
    pub size_bytes: u64,
}

impl CommitInfo {
    pub fn is_open(&self) -> bool {
        self.state == CommitState::Open
    }
}

/// A file as seen by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    /// the commit the file was read through
    pub commit: CommitId,
}

/// Summary of a repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: RepoName,
    pub created: DateTime<Utc>,
    pub commits: usize,
    pub branches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_validation() {
        assert!(RepoName::new("images").is_ok());
        assert!(RepoName::new("raw-data_2").is_ok());
        assert_eq!(RepoName::new(""), Err(InvalidNameError::Empty));
        assert_eq!(RepoName::new("_x"), Err(InvalidNameError::InvalidStart('_')));
        assert!(matches!(
            RepoName::new("a/b"),
            Err(InvalidNameError::InvalidCharacter { char: '/', position: 1 })
        ));
        assert!(matches!(RepoName::new("x".repeat(65)), Err(InvalidNameError::TooLong(65))));
    }

    #[test]
    fn test_branch_name_validation() {
        assert_eq!(BranchName::master().as_str(), "master");
        assert!(BranchName::new("v1.2").is_ok());
        assert!(BranchName::new("a..b").is_err());
        assert!(BranchName::new("feature/x").is_err());
    }

    #[test]
    fn test_commit_state_serde() {
        let json = serde_json::to_string(&CommitState::Finished).unwrap();
        assert_eq!(json, "\"FINISHED\"");
    }
}
