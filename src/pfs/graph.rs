//! Commit and branch graph of one repo.
//!
//! Commits form a DAG through their parent links; branches are named
//! pointers into it. This module handles:
//! - commit lifecycle bookkeeping (open, finishing, finished, aborted)
//! - branch creation, movement and deletion
//! - resolution of a commit reference (branch name or commit ID)
//! - per-commit file bookkeeping: active writers, completed files and
//!   files whose write session failed validation
//!
//! The graph holds no locks; the repo state that owns it does.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::pfs::error::{PfsError, PfsResult};
use crate::pfs::types::{BranchName, CommitInfo, CommitState, RepoName};
use crate::storage::CommitId;

/// A commit plus the file bookkeeping needed while it is open.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub info: CommitInfo,
    /// set while finish is flushing; blocks new writes
    pub finishing: bool,
    /// paths with an open write handle
    pub writers: BTreeSet<String>,
    /// paths with at least one entry written under this commit
    pub touched: BTreeSet<String>,
    /// paths whose last write session closed cleanly
    pub completed: BTreeSet<String>,
    /// paths whose last write session failed validation
    pub invalid: BTreeSet<String>,
}

impl CommitRecord {
    /// Whether new writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.info.state == CommitState::Open && !self.finishing
    }

    /// Revoke every open write claim; the claimed paths become invalid.
    pub fn abandon_writers(&mut self) {
        for path in std::mem::take(&mut self.writers) {
            self.completed.remove(&path);
            self.invalid.insert(path);
        }
    }
}

#[derive(Debug)]
pub struct RepoGraph {
    name: RepoName,
    created: DateTime<Utc>,
    commits: HashMap<CommitId, CommitRecord>,
    branches: BTreeMap<BranchName, CommitId>,
}

impl RepoGraph {
    pub fn new(name: RepoName) -> Self {
        Self {
            name,
            created: Utc::now(),
            commits: HashMap::new(),
            branches: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &RepoName {
        &self.name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    fn not_found(&self, commit: impl ToString) -> PfsError {
        PfsError::CommitNotFound {
            repo: self.name.to_string(),
            commit: commit.to_string(),
        }
    }

    // ==================== Commits ====================

    /// Open a new commit.
    ///
    /// The parent is `parent` if given, otherwise the head of `branch` if
    /// the branch exists, otherwise none. Parents must be finished.
    pub fn start_commit(
        &mut self,
        branch: Option<&BranchName>,
        parent: Option<CommitId>,
    ) -> PfsResult<CommitInfo> {
        let parent = match parent {
            Some(parent) => Some(parent),
            None => branch.and_then(|b| self.branches.get(b).copied()),
        };
        if let Some(parent) = parent {
            let finished = self
                .commits
                .get(&parent)
                .map(|p| p.info.state == CommitState::Finished);
            if finished != Some(true) {
                return Err(PfsError::InvalidParent {
                    repo: self.name.to_string(),
                    parent: parent.to_string(),
                });
            }
        }

        let info = CommitInfo {
            id: CommitId::generate(),
            repo: self.name.clone(),
            parent,
            branch: branch.cloned(),
            state: CommitState::Open,
            started: Utc::now(),
            finished: None,
            size_bytes: 0,
        };
        self.commits.insert(
            info.id,
            CommitRecord {
                info: info.clone(),
                finishing: false,
                writers: BTreeSet::new(),
                touched: BTreeSet::new(),
                completed: BTreeSet::new(),
                invalid: BTreeSet::new(),
            },
        );
        Ok(info)
    }

    pub fn get(&self, commit: CommitId) -> PfsResult<&CommitRecord> {
        self.commits.get(&commit).ok_or_else(|| self.not_found(commit))
    }

    pub fn get_mut(&mut self, commit: CommitId) -> PfsResult<&mut CommitRecord> {
        match self.commits.get_mut(&commit) {
            Some(record) => Ok(record),
            None => Err(PfsError::CommitNotFound {
                repo: self.name.to_string(),
                commit: commit.to_string(),
            }),
        }
    }

    /// Get a commit that still accepts writes.
    pub fn writable_mut(&mut self, commit: CommitId) -> PfsResult<&mut CommitRecord> {
        let record = self.get_mut(commit)?;
        if !record.is_writable() {
            return Err(PfsError::NotOpen(commit));
        }
        Ok(record)
    }

    /// Mark a commit finished and advance the branch it was started on.
    pub fn complete_finish(&mut self, commit: CommitId) -> PfsResult<CommitInfo> {
        let record = self.get_mut(commit)?;
        record.finishing = false;
        record.info.state = CommitState::Finished;
        record.info.finished = Some(Utc::now());
        record.abandon_writers();
        let info = record.info.clone();
        if let Some(branch) = &info.branch {
            self.branches.insert(branch.clone(), commit);
        }
        Ok(info)
    }

    /// Forget an open commit. Branches pointing at it fall back to its
    /// parent, or are removed when it has none.
    pub fn remove_commit(&mut self, commit: CommitId) -> PfsResult<CommitRecord> {
        if !self.get(commit)?.is_writable() {
            return Err(PfsError::NotOpen(commit));
        }
        let record = self
            .commits
            .remove(&commit)
            .ok_or_else(|| self.not_found(commit))?;
        let parent = record.info.parent;
        self.branches.retain(|_, head| *head != commit || parent.is_some());
        for head in self.branches.values_mut() {
            if *head == commit {
                if let Some(parent) = parent {
                    *head = parent;
                }
            }
        }
        Ok(record)
    }

    /// The commit followed by its ancestors, nearest first.
    pub fn ancestry(&self, commit: CommitId) -> PfsResult<Vec<CommitId>> {
        let mut lineage = vec![commit];
        let mut current = self.get(commit)?.info.parent;
        while let Some(parent) = current {
            lineage.push(parent);
            current = self.get(parent)?.info.parent;
        }
        Ok(lineage)
    }

    /// All commits, newest first.
    pub fn list_commits(&self) -> Vec<CommitInfo> {
        let mut commits: Vec<CommitInfo> = self.commits.values().map(|r| r.info.clone()).collect();
        commits.sort_by(|a, b| b.id.cmp(&a.id));
        commits
    }

    // ==================== Branches ====================

    /// Point `branch` at `commit`, creating the branch if needed.
    pub fn set_branch(&mut self, branch: BranchName, commit: CommitId) -> PfsResult<Option<CommitId>> {
        self.get(commit)?;
        Ok(self.branches.insert(branch, commit))
    }

    pub fn delete_branch(&mut self, branch: &BranchName) -> PfsResult<CommitId> {
        self.branches
            .remove(branch)
            .ok_or_else(|| PfsError::BranchNotFound {
                repo: self.name.to_string(),
                branch: branch.to_string(),
            })
    }

    pub fn branch_head(&self, branch: &BranchName) -> Option<CommitId> {
        self.branches.get(branch).copied()
    }

    pub fn list_branches(&self) -> Vec<(BranchName, CommitId)> {
        self.branches.iter().map(|(b, c)| (b.clone(), *c)).collect()
    }

    /// Resolve a branch name or a commit ID to a commit.
    ///
    /// Branch names take precedence.
    pub fn resolve(&self, reference: &str) -> PfsResult<CommitId> {
        if let Ok(branch) = BranchName::new(reference) {
            if let Some(head) = self.branch_head(&branch) {
                return Ok(head);
            }
        }
        match CommitId::parse(reference) {
            Ok(commit) if self.commits.contains_key(&commit) => Ok(commit),
            Ok(_) => Err(self.not_found(reference)),
            Err(_) => Err(PfsError::BranchNotFound {
                repo: self.name.to_string(),
                branch: reference.to_string(),
            }),
        }
    }
}
