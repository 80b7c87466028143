//! Read resolution.
//!
//! A read looks at every source that may hold the path (the active buffer,
//! frozen buffers, then each level's shards) through one merged scan.
//! Entries are grouped by commit, and the lineage of the commit being read
//! is walked from the commit itself towards the root: the first commit that
//! wrote anything for the path defines it, either as content or as deleted.
//!
//! A commit's entries are never materialized as a whole file unless the
//! caller asks for the whole file; sizes come from the entry extents and
//! ranged reads copy only the bytes they return.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::levels::LevelManager;
use crate::storage::merge::{EntrySource, MergeIter};
use crate::storage::shard::ShardIter;
use crate::storage::types::{CommitId, Entry, PathRange, Payload};

/// The data one commit wrote for a path after its latest truncation, in
/// write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileView<'a> {
    writes: Vec<&'a Entry>,
    size: u64,
}

impl<'a> FileView<'a> {
    /// End of the furthest write. Bytes no write covered read as zero.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Up to `len` bytes starting at `offset`; empty at or past the end.
    pub fn read_range(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset.min(self.size);
        let end = start.saturating_add(len as u64).min(self.size);
        // bounded by `len`
        let mut out = vec![0u8; (end - start) as usize];
        self.fill(&mut out, start);
        out
    }

    /// The whole file.
    ///
    /// Fails instead of aborting when the file cannot be held in memory.
    pub fn contents(&self, path: &str) -> StorageResult<Vec<u8>> {
        let too_large = || StorageError::FileTooLarge {
            path: path.to_string(),
            size: self.size,
        };
        let size = usize::try_from(self.size).map_err(|_| too_large())?;
        let mut out = Vec::new();
        out.try_reserve_exact(size).map_err(|_| too_large())?;
        out.resize(size, 0);
        self.fill(&mut out, 0);
        Ok(out)
    }

    /// Copy every write's overlap with `[start, start + out.len())`.
    fn fill(&self, out: &mut [u8], start: u64) {
        let end = start + out.len() as u64;
        for entry in &self.writes {
            let Payload::Data(data) = &entry.payload else {
                continue;
            };
            let write_start = entry.key.offset;
            let write_end = write_start.saturating_add(data.len() as u64);
            let lo = write_start.max(start);
            let hi = write_end.min(end);
            if lo >= hi {
                continue;
            }
            out[(lo - start) as usize..(hi - start) as usize]
                .copy_from_slice(&data[(lo - write_start) as usize..(hi - write_start) as usize]);
        }
    }
}

/// What a single commit's entries say about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<'a> {
    Content(FileView<'a>),
    Deleted,
}

/// Fold one commit's entries for a path into the file they describe.
///
/// Only data written after the latest tombstone counts; later writes win
/// where they overlap.
pub fn resolve_group(entries: &[Entry]) -> Resolved<'_> {
    let tombstone_seq = entries
        .iter()
        .filter(|e| e.is_tombstone())
        .map(|e| e.seq)
        .max();
    let mut writes: Vec<&Entry> = entries
        .iter()
        .filter(|e| !e.is_tombstone() && tombstone_seq.map_or(true, |t| e.seq > t))
        .collect();
    if writes.is_empty() && tombstone_seq.is_some() {
        return Resolved::Deleted;
    }

    writes.sort_by_key(|e| e.seq);
    let size = writes
        .iter()
        .map(|e| match &e.payload {
            Payload::Data(data) => e.key.offset.saturating_add(data.len() as u64),
            Payload::Tombstone { .. } => 0,
        })
        .max()
        .unwrap_or(0);
    Resolved::Content(FileView { writes, size })
}

/// Pick the defining commit for one path out of its per-commit entries.
fn resolve_lineage<'a>(
    groups: &'a HashMap<CommitId, Vec<Entry>>,
    lineage: &[CommitId],
) -> Option<FileView<'a>> {
    lineage
        .iter()
        .find_map(|commit| groups.get(commit))
        .and_then(|entries| match resolve_group(entries) {
            Resolved::Content(view) => Some(view),
            Resolved::Deleted => None,
        })
}

impl LevelManager {
    /// Merged entries for every path in `range`, most recent write per key.
    ///
    /// Entries of aborted commits are skipped.
    pub fn scan(&self, range: &PathRange) -> StorageResult<impl Iterator<Item = StorageResult<Entry>> + '_> {
        self.ensure_open()?;

        // active first, then frozen, then shards: a concurrent flush can only
        // move entries later in this order, never out from under the scan
        let active = self.active.lock().collect_range(range);
        let frozen: Vec<Vec<Entry>> = self
            .frozen
            .read()
            .iter()
            .map(|buffer| buffer.collect_range(range))
            .collect();
        let version = self.snapshot();

        let mut sources: Vec<EntrySource<'static>> = Vec::new();
        sources.push(Box::new(active.into_iter().map(Ok::<Entry, StorageError>)));
        for entries in frozen {
            sources.push(Box::new(entries.into_iter().map(Ok::<Entry, StorageError>)));
        }

        let (prefix, exact) = match range {
            PathRange::Exact(p) => (p.as_str(), true),
            PathRange::Under(p) => (p.as_str(), false),
        };
        for meta in version.shards() {
            if !meta.may_contain_paths(prefix, exact) {
                continue;
            }
            let in_scan = range.clone();
            let contains = range.clone();
            let iter = ShardIter::from_key(self.store.clone(), Arc::clone(meta), range.start_key())
                .take_while(move |r| r.as_ref().map_or(true, |e| in_scan.in_scan(&e.key.path)))
                .filter(move |r| r.as_ref().map_or(true, |e| contains.contains(&e.key.path)));
            sources.push(Box::new(iter));
        }

        Ok(MergeIter::new(sources).filter(move |r| match r {
            Ok(entry) => !self.is_retired(&entry.key.commit),
            Err(_) => true,
        }))
    }

    /// Entries of `path` written by commits in `lineage`, by commit.
    fn lineage_groups(&self, path: &str, lineage: &[CommitId]) -> StorageResult<HashMap<CommitId, Vec<Entry>>> {
        let mut groups: HashMap<CommitId, Vec<Entry>> = HashMap::new();
        for item in self.scan(&PathRange::Exact(path.to_string()))? {
            let entry = item?;
            if lineage.contains(&entry.key.commit) {
                groups.entry(entry.key.commit).or_default().push(entry);
            }
        }
        Ok(groups)
    }

    /// Read `path` as seen by the first commit of `lineage`.
    ///
    /// `lineage` lists the commit being read followed by its ancestors,
    /// nearest first. `None` means absent or deleted.
    pub fn read_file(&self, path: &str, lineage: &[CommitId]) -> StorageResult<Option<Vec<u8>>> {
        let groups = self.lineage_groups(path, lineage)?;
        resolve_lineage(&groups, lineage)
            .map(|view| view.contents(path))
            .transpose()
    }

    /// Read up to `len` bytes of `path` starting at `offset`.
    ///
    /// Reading at or past the end yields an empty buffer.
    pub fn read_file_range(
        &self,
        path: &str,
        lineage: &[CommitId],
        offset: u64,
        len: usize,
    ) -> StorageResult<Option<Vec<u8>>> {
        let groups = self.lineage_groups(path, lineage)?;
        Ok(resolve_lineage(&groups, lineage).map(|view| view.read_range(offset, len)))
    }

    /// Every live file under `range` as seen by the first commit of
    /// `lineage`, with its size.
    pub fn list_files(&self, range: &PathRange, lineage: &[CommitId]) -> StorageResult<BTreeMap<String, u64>> {
        let mut files = BTreeMap::new();
        let mut current: Option<String> = None;
        let mut groups: HashMap<CommitId, Vec<Entry>> = HashMap::new();

        let mut settle = |path: Option<String>, groups: &mut HashMap<CommitId, Vec<Entry>>| {
            if let Some(path) = path {
                if let Some(view) = resolve_lineage(groups, lineage) {
                    files.insert(path, view.size());
                }
            }
            groups.clear();
        };

        // the scan is path-ordered, so one path's history is held at a time
        for item in self.scan(range)? {
            let entry = item?;
            if current.as_deref() != Some(entry.key.path.as_str()) {
                settle(current.take(), &mut groups);
                current = Some(entry.key.path.clone());
            }
            if lineage.contains(&entry.key.commit) {
                groups.entry(entry.key.commit).or_default().push(entry);
            }
        }
        settle(current, &mut groups);
        Ok(files)
    }
}
