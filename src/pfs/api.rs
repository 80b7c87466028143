//! Engine API - repos, commits, branches and files.
//!
//! [`Pfs`] is the entry point the RPC layer, the mount adapter and the
//! shell all go through. It owns one [`LevelManager`] and one commit graph
//! per repo. Repos are independent: each has its own locks, and the repo
//! map itself is only write-locked to add or remove a repo.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::pfs::config::PfsConfig;
use crate::pfs::error::{PfsError, PfsResult};
use crate::pfs::graph::RepoGraph;
use crate::pfs::types::{BranchName, CommitInfo, CommitState, FileInfo, RepoInfo, RepoName};
use crate::storage::{
    normalize_path, normalize_prefix, CommitId, CompactionResult, FsSegmentStore, LevelManager,
    MemorySegmentStore, PathRange, SegmentStore, StorageStats, VerifyReport,
};

/// Graph and storage of one repo.
pub(crate) struct RepoState {
    graph: RwLock<RepoGraph>,
    storage: LevelManager,
    /// Serializes finishes within the repo.
    finish_lock: Mutex<()>,
}

impl RepoState {
    fn info(&self) -> RepoInfo {
        let graph = self.graph.read();
        RepoInfo {
            name: graph.name().clone(),
            created: graph.created(),
            commits: graph.commit_count(),
            branches: graph.branch_count(),
        }
    }
}

/// The engine handle.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct Pfs {
    inner: Arc<PfsInner>,
}

struct PfsInner {
    config: PfsConfig,
    store: Arc<dyn SegmentStore>,
    repos: RwLock<HashMap<RepoName, Arc<RepoState>>>,
}

impl Pfs {
    /// Open an engine with the given configuration.
    ///
    /// Segments go to `config.data_dir` when set, otherwise to memory.
    pub fn open(config: PfsConfig) -> PfsResult<Self> {
        let store: Arc<dyn SegmentStore> = match &config.data_dir {
            Some(dir) => Arc::new(FsSegmentStore::open(dir)?),
            None => Arc::new(MemorySegmentStore::new()),
        };
        Self::with_store(config, store)
    }

    /// Open an in-memory engine with default settings.
    pub fn in_memory() -> PfsResult<Self> {
        Self::open(PfsConfig::in_memory())
    }

    /// Open an engine on top of an existing segment store.
    pub fn with_store(config: PfsConfig, store: Arc<dyn SegmentStore>) -> PfsResult<Self> {
        config
            .storage
            .validate()
            .map_err(|e| PfsError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(PfsInner {
                config,
                store,
                repos: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &PfsConfig {
        &self.inner.config
    }

    pub(crate) fn repo(&self, name: &str) -> PfsResult<Arc<RepoState>> {
        let name = RepoName::new(name)?;
        self.inner
            .repos
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| PfsError::RepoNotFound(name.to_string()))
    }

    // ==================== Repos ====================

    /// Create an empty repo.
    pub fn create_repo(&self, name: &str) -> PfsResult<RepoInfo> {
        let name = RepoName::new(name)?;
        let mut repos = self.inner.repos.write();
        if repos.contains_key(&name) {
            return Err(PfsError::RepoExists(name.to_string()));
        }
        let storage = LevelManager::new(
            name.as_str(),
            self.inner.config.storage.clone(),
            self.inner.store.clone(),
        )?;
        let state = Arc::new(RepoState {
            graph: RwLock::new(RepoGraph::new(name.clone())),
            storage,
            finish_lock: Mutex::new(()),
        });
        let info = state.info();
        repos.insert(name.clone(), state);
        info!(repo = %name, "created repo");
        Ok(info)
    }

    /// Delete a repo and every segment it owns.
    pub fn delete_repo(&self, name: &str) -> PfsResult<()> {
        let name = RepoName::new(name)?;
        let state = self
            .inner
            .repos
            .write()
            .remove(&name)
            .ok_or_else(|| PfsError::RepoNotFound(name.to_string()))?;
        state.storage.close()?;
        info!(repo = %name, "deleted repo");
        Ok(())
    }

    /// All repos, by name.
    pub fn list_repos(&self) -> Vec<RepoInfo> {
        let repos: Vec<Arc<RepoState>> = self.inner.repos.read().values().cloned().collect();
        let mut infos: Vec<RepoInfo> = repos.iter().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn inspect_repo(&self, name: &str) -> PfsResult<RepoInfo> {
        Ok(self.repo(name)?.info())
    }

    // ==================== Commits ====================

    /// Open a new commit in `repo`.
    ///
    /// When `parent` is omitted the head of `branch` (if any) becomes the
    /// parent. Finishing the commit moves `branch` to it.
    pub fn start_commit(
        &self,
        repo: &str,
        branch: Option<&str>,
        parent: Option<CommitId>,
    ) -> PfsResult<CommitId> {
        let state = self.repo(repo)?;
        let branch = branch.map(BranchName::new).transpose()?;
        let info = state.graph.write().start_commit(branch.as_ref(), parent)?;
        debug!(
            repo,
            commit = %info.id,
            parent = ?info.parent.map(|p| p.short()),
            "started commit"
        );
        Ok(info.id)
    }

    /// Make an open commit immutable.
    ///
    /// Paths whose write session failed validation, and paths still open
    /// for write, are deleted; buffered writes are flushed, and the commit's
    /// branch advances to it. If the flush fails the commit stays open with
    /// those paths deleted, and the call can be repeated.
    pub fn finish_commit(&self, repo: &str, commit: CommitId) -> PfsResult<CommitInfo> {
        let state = self.repo(repo)?;
        let _finishing = state.finish_lock.lock();

        let (dropped, unclosed, inherits) = {
            let mut graph = state.graph.write();
            let record = graph.writable_mut(commit)?;
            record.finishing = true;
            // open handles lose their claim now; closing them reports the drop
            let unclosed: Vec<String> = record.writers.iter().cloned().collect();
            record.abandon_writers();
            let dropped: Vec<String> = record.invalid.iter().cloned().collect();
            (dropped, unclosed, record.info.parent.is_some())
        };
        for path in &unclosed {
            warn!(repo, commit = %commit, path = %path, "finishing with file still open for write, dropping it");
        }

        let flushed = (|| -> PfsResult<()> {
            for path in &dropped {
                state.storage.put_tombstone(path, commit, inherits)?;
            }
            state.storage.flush()?;
            Ok(())
        })();
        if let Err(e) = flushed {
            warn!(repo, commit = %commit, error = %e, "finish failed, commit stays open");
            state.graph.write().get_mut(commit)?.finishing = false;
            return Err(e);
        }

        let info = state.graph.write().complete_finish(commit)?;
        info!(
            repo,
            commit = %commit,
            branch = ?info.branch.as_ref().map(|b| b.to_string()),
            dropped_paths = dropped.len(),
            "finished commit"
        );

        // the commit is durable now; a failed compaction is retried by the next trigger
        if let Err(e) = state.storage.maybe_compact() {
            warn!(repo, error = %e, "compaction after finish failed");
        }
        Ok(info)
    }

    /// Discard an open commit and everything written to it.
    pub fn abort_commit(&self, repo: &str, commit: CommitId) -> PfsResult<()> {
        let state = self.repo(repo)?;
        let record = state.graph.write().remove_commit(commit)?;
        let dropped = state.storage.discard_commit(commit);
        info!(
            repo,
            commit = %commit,
            files = record.touched.len(),
            dropped,
            "aborted commit"
        );
        Ok(())
    }

    pub fn get_commit_state(&self, repo: &str, commit: CommitId) -> PfsResult<CommitState> {
        let state = self.repo(repo)?;
        let graph = state.graph.read();
        Ok(graph.get(commit)?.info.state)
    }

    /// Resolve a branch name or commit ID.
    pub fn resolve_commit(&self, repo: &str, reference: &str) -> PfsResult<CommitId> {
        self.repo(repo)?.graph.read().resolve(reference)
    }

    pub fn inspect_commit(&self, repo: &str, commit: CommitId) -> PfsResult<CommitInfo> {
        let state = self.repo(repo)?;
        let graph = state.graph.read();
        Ok(graph.get(commit)?.info.clone())
    }

    /// All commits of a repo, newest first.
    pub fn list_commits(&self, repo: &str) -> PfsResult<Vec<CommitInfo>> {
        Ok(self.repo(repo)?.graph.read().list_commits())
    }

    /// A commit followed by its ancestors, nearest first.
    pub fn ancestry(&self, repo: &str, commit: CommitId) -> PfsResult<Vec<CommitId>> {
        self.repo(repo)?.graph.read().ancestry(commit)
    }

    // ==================== Branches ====================

    /// Create a branch; fails if it already exists.
    pub fn create_branch(&self, repo: &str, branch: &str, commit: CommitId) -> PfsResult<()> {
        let state = self.repo(repo)?;
        let branch = BranchName::new(branch)?;
        let mut graph = state.graph.write();
        if graph.branch_head(&branch).is_some() {
            return Err(PfsError::BranchExists {
                repo: repo.to_string(),
                branch: branch.to_string(),
            });
        }
        graph.set_branch(branch, commit)?;
        Ok(())
    }

    /// Point a branch at a commit, creating it if needed.
    pub fn set_branch(&self, repo: &str, branch: &str, commit: CommitId) -> PfsResult<()> {
        let state = self.repo(repo)?;
        let branch = BranchName::new(branch)?;
        let previous = state.graph.write().set_branch(branch.clone(), commit)?;
        debug!(repo, branch = %branch, commit = %commit, previous = ?previous.map(|c| c.short()), "moved branch");
        Ok(())
    }

    pub fn delete_branch(&self, repo: &str, branch: &str) -> PfsResult<()> {
        let state = self.repo(repo)?;
        let branch = BranchName::new(branch)?;
        state.graph.write().delete_branch(&branch)?;
        Ok(())
    }

    pub fn list_branches(&self, repo: &str) -> PfsResult<Vec<(BranchName, CommitId)>> {
        Ok(self.repo(repo)?.graph.read().list_branches())
    }

    // ==================== Writes ====================

    /// Claim `path` in an open commit for a new write session.
    ///
    /// Content the commit already wrote for the path is replaced. Returns
    /// the normalized path.
    pub fn begin_write(&self, repo: &str, commit: CommitId, path: &str) -> PfsResult<String> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;

        let mut graph = state.graph.write();
        let (truncate, inherits) = {
            let record = graph.writable_mut(commit)?;
            if record.writers.contains(&path) {
                return Err(PfsError::ConcurrentWriter { commit, path });
            }
            record.writers.insert(path.clone());
            record.completed.remove(&path);
            record.invalid.remove(&path);
            (!record.touched.insert(path.clone()), record.info.parent.is_some())
        };
        // keep the commit pinned open while buffering
        let graph = RwLockWriteGuard::downgrade(graph);

        let buffered = (|| -> PfsResult<()> {
            if truncate {
                state.storage.put_tombstone(&path, commit, inherits)?;
            }
            // an empty entry at offset 0 makes the file exist even if nothing is written
            state.storage.put_data(&path, commit, 0, Vec::new())?;
            Ok(())
        })();
        drop(graph);

        if let Err(e) = buffered {
            if let Ok(record) = state.graph.write().get_mut(commit) {
                record.writers.remove(&path);
            }
            return Err(e);
        }
        debug!(repo, commit = %commit.short(), path = %path, truncate, "opened file for write");
        Ok(path)
    }

    /// Buffer `data` at `offset` of `path` in an open commit.
    pub fn write_chunk(
        &self,
        repo: &str,
        commit: CommitId,
        path: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> PfsResult<()> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;

        let mut graph = state.graph.write();
        {
            let record = graph.writable_mut(commit)?;
            record.touched.insert(path.clone());
            record.info.size_bytes += data.len() as u64;
        }
        let _graph = RwLockWriteGuard::downgrade(graph);
        state.storage.put_data(&path, commit, offset, data)?;
        Ok(())
    }

    /// Release the write claim on `path`, recording whether the session
    /// produced a valid file. Invalid files are deleted when the commit
    /// finishes.
    ///
    /// A claim revoked by `finish_commit` fails with `NotOpen` for a valid
    /// session: the file it wrote was dropped.
    pub fn end_write(&self, repo: &str, commit: CommitId, path: &str, valid: bool) -> PfsResult<()> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;
        let mut graph = state.graph.write();
        let record = graph.get_mut(commit)?;
        if !record.writers.remove(&path) {
            if valid {
                warn!(repo, commit = %commit, path = %path, "write session closed after its file was dropped");
                return Err(PfsError::NotOpen(commit));
            }
            warn!(repo, commit = %commit, path = %path, "invalid write session closed after its file was dropped");
            return Ok(());
        }
        if valid {
            record.invalid.remove(&path);
            record.completed.insert(path);
        } else {
            record.completed.remove(&path);
            record.invalid.insert(path);
        }
        Ok(())
    }

    /// Write a whole file in one call.
    pub fn put_file(&self, repo: &str, commit: CommitId, path: &str, data: Vec<u8>) -> PfsResult<()> {
        let path = self.begin_write(repo, commit, path)?;
        let written = if data.is_empty() {
            Ok(())
        } else {
            self.write_chunk(repo, commit, &path, 0, data)
        };
        self.end_write(repo, commit, &path, written.is_ok())?;
        written
    }

    /// Delete `path` in an open commit.
    pub fn delete_file(&self, repo: &str, commit: CommitId, path: &str) -> PfsResult<()> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;

        let mut graph = state.graph.write();
        let inherits = {
            let record = graph.writable_mut(commit)?;
            if record.writers.contains(&path) {
                return Err(PfsError::ConcurrentWriter { commit, path });
            }
            record.touched.insert(path.clone());
            record.completed.remove(&path);
            record.invalid.remove(&path);
            record.info.parent.is_some()
        };
        let _graph = RwLockWriteGuard::downgrade(graph);
        state.storage.put_tombstone(&path, commit, inherits)?;
        debug!(repo, commit = %commit.short(), path = %path, "deleted file");
        Ok(())
    }

    // ==================== Reads ====================

    /// Lineage to read `path` through, or `FileNotFound` if the commit
    /// itself marked the path invalid.
    fn read_lineage(&self, state: &RepoState, commit: CommitId, path: &str) -> PfsResult<Vec<CommitId>> {
        let graph = state.graph.read();
        if graph.get(commit)?.invalid.contains(path) {
            return Err(PfsError::FileNotFound {
                commit,
                path: path.to_string(),
            });
        }
        graph.ancestry(commit)
    }

    /// Read a whole file as seen by `commit`.
    pub fn get_file(&self, repo: &str, commit: CommitId, path: &str) -> PfsResult<Vec<u8>> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;
        let lineage = self.read_lineage(&state, commit, &path)?;
        state
            .storage
            .read_file(&path, &lineage)?
            .ok_or(PfsError::FileNotFound { commit, path })
    }

    /// Read up to `len` bytes at `offset`. Past the end reads empty.
    pub fn read_file_range(
        &self,
        repo: &str,
        commit: CommitId,
        path: &str,
        offset: u64,
        len: usize,
    ) -> PfsResult<Vec<u8>> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;
        let lineage = self.read_lineage(&state, commit, &path)?;
        state
            .storage
            .read_file_range(&path, &lineage, offset, len)?
            .ok_or(PfsError::FileNotFound { commit, path })
    }

    pub fn stat_file(&self, repo: &str, commit: CommitId, path: &str) -> PfsResult<FileInfo> {
        let path = normalize_path(path)?;
        let state = self.repo(repo)?;
        let lineage = self.read_lineage(&state, commit, &path)?;
        let files = state
            .storage
            .list_files(&PathRange::Exact(path.clone()), &lineage)?;
        match files.get(&path) {
            Some(size) => Ok(FileInfo {
                path,
                size: *size,
                commit,
            }),
            None => Err(PfsError::FileNotFound { commit, path }),
        }
    }

    /// Files at or below `prefix` as seen by `commit`, by path.
    pub fn list_files(&self, repo: &str, commit: CommitId, prefix: &str) -> PfsResult<Vec<FileInfo>> {
        let prefix = normalize_prefix(prefix)?;
        let state = self.repo(repo)?;
        let (lineage, invalid) = {
            let graph = state.graph.read();
            (graph.ancestry(commit)?, graph.get(commit)?.invalid.clone())
        };
        let files = state.storage.list_files(&PathRange::Under(prefix), &lineage)?;
        Ok(files
            .into_iter()
            .filter(|(path, _)| !invalid.contains(path))
            .map(|(path, size)| FileInfo { path, size, commit })
            .collect())
    }

    // ==================== Maintenance ====================

    /// Flush buffered writes of a repo and compact if thresholds are crossed.
    pub fn flush(&self, repo: &str) -> PfsResult<usize> {
        let state = self.repo(repo)?;
        let published = state.storage.flush()?;
        state.storage.maybe_compact()?;
        Ok(published)
    }

    /// Flush, then compact every level of a repo.
    pub fn compact(&self, repo: &str) -> PfsResult<Vec<CompactionResult>> {
        let state = self.repo(repo)?;
        state.storage.flush()?;
        Ok(state.storage.compact()?)
    }

    pub fn verify(&self, repo: &str) -> PfsResult<VerifyReport> {
        Ok(self.repo(repo)?.storage.verify()?)
    }

    pub fn storage_stats(&self, repo: &str) -> PfsResult<StorageStats> {
        Ok(self.repo(repo)?.storage.stats())
    }
}
