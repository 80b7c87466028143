//! Leveled compaction.
//!
//! Compacting level `L` merges every shard of `L` with the shards of `L + 1`
//! whose group range overlaps it, and writes the result into `L + 1`. The
//! merge streams through a [`MergeIter`], one (path, commit) group at a
//! time, so memory stays bounded by the largest group rather than the level.
//!
//! Within a group:
//! - data older than the group's tombstone is dropped;
//! - a tombstone is dropped only when the output lands in the deepest level
//!   and either it hides nothing inherited or newer data now defines the file;
//! - groups of aborted commits are dropped whole.
//!
//! Output shards are cut at group boundaries once they reach the level's
//! target size, so a group never spans two shards of one level.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::error::StorageResult;
use crate::storage::levels::{LevelManager, LevelSet};
use crate::storage::merge::{EntrySource, MergeIter};
use crate::storage::shard::{ShardIter, ShardMeta, ShardWriter};
use crate::storage::types::{CommitId, Entry, Payload, ShardId};

/// Result of compacting one level into the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub level: usize,
    pub output_level: usize,
    /// shards consumed from both levels
    pub consumed: usize,
    pub produced: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub entries_dropped: u64,
    /// set when the repo closed mid-run and the output was thrown away
    pub discarded: bool,
}

/// Reduce one group to the entries that still matter.
fn compact_group(group: Vec<Entry>, bottom: bool, retired: &HashSet<CommitId>) -> Vec<Entry> {
    match group.first() {
        None => return group,
        Some(first) if retired.contains(&first.key.commit) => return Vec::new(),
        Some(_) => {}
    }

    let tombstone_seq = group.iter().filter(|e| e.is_tombstone()).map(|e| e.seq).max();
    let has_live_data = group
        .iter()
        .any(|e| !e.is_tombstone() && tombstone_seq.map_or(true, |t| e.seq > t));

    group
        .into_iter()
        .filter(|e| match e.payload {
            Payload::Data(_) => tombstone_seq.map_or(true, |t| e.seq > t),
            Payload::Tombstone { inherits } => !(bottom && (!inherits || has_live_data)),
        })
        .collect()
}

/// Writes compacted groups into size-bounded output shards.
struct OutputBuilder<'a> {
    manager: &'a LevelManager,
    level: usize,
    target: u64,
    writer: Option<ShardWriter>,
    produced: Vec<Arc<ShardMeta>>,
}

impl<'a> OutputBuilder<'a> {
    fn new(manager: &'a LevelManager, level: usize) -> Self {
        Self {
            manager,
            level,
            target: manager.config.target_shard_size(level),
            writer: None,
            produced: Vec::new(),
        }
    }

    fn add_group(&mut self, group: Vec<Entry>) -> StorageResult<()> {
        if group.is_empty() {
            return Ok(());
        }
        if self.writer.as_ref().map_or(false, |w| w.size() >= self.target) {
            self.seal()?;
        }
        let manager = self.manager;
        let level = self.level;
        let writer = self.writer.get_or_insert_with(|| {
            let seq = manager.next_shard_seq.fetch_add(1, Ordering::SeqCst);
            ShardWriter::new(level, seq, manager.config.block_size)
        });
        for entry in &group {
            writer.add(entry);
        }
        Ok(())
    }

    fn seal(&mut self) -> StorageResult<()> {
        if let Some(encoded) = self.writer.take().and_then(ShardWriter::finish) {
            let store = self.manager.store.as_ref();
            let meta = self.manager.with_retry("compaction", || encoded.persist(store))?;
            self.produced.push(meta);
        }
        Ok(())
    }

    /// Delete everything written so far.
    fn abandon(self) {
        for meta in &self.produced {
            if let Err(e) = self.manager.store.delete_segment(meta.id) {
                warn!(shard = %meta.id.short(), error = %e, "failed to delete abandoned compaction output");
            }
        }
    }
}

impl LevelManager {
    /// Whether `level` has crossed its shard-count or size threshold.
    pub fn needs_compaction(&self, version: &LevelSet, level: usize) -> bool {
        if level >= self.config.deepest_level() || version.level(level).is_empty() {
            return false;
        }
        version.level(level).len() >= self.config.shard_threshold
            || version.level_bytes(level) >= self.config.level_size_limit(level)
    }

    /// Compact every level over its threshold, top down.
    ///
    /// Returns immediately if another compaction is running; the running
    /// one re-checks thresholds level by level as it cascades.
    pub fn maybe_compact(&self) -> StorageResult<Vec<CompactionResult>> {
        let Some(_guard) = self.compaction_lock.try_lock() else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for level in 0..self.config.deepest_level() {
            if self.needs_compaction(&self.snapshot(), level) {
                if let Some(result) = self.compact_level_locked(level)? {
                    results.push(result);
                }
            }
        }
        Ok(results)
    }

    /// Compact every non-empty level regardless of thresholds, pushing all
    /// data into the deepest level.
    pub fn compact(&self) -> StorageResult<Vec<CompactionResult>> {
        let _guard = self.compaction_lock.lock();
        let mut results = Vec::new();
        for level in 0..self.config.deepest_level() {
            if let Some(result) = self.compact_level_locked(level)? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Compact `level` into `level + 1`. The caller holds the compaction lock.
    fn compact_level_locked(&self, level: usize) -> StorageResult<Option<CompactionResult>> {
        self.ensure_open()?;
        let output_level = level + 1;

        // everything below works from this snapshot; flushes keep landing
        // in level 0 meanwhile
        let version = self.snapshot();
        let inputs: Vec<Arc<ShardMeta>> = version.level(level).to_vec();
        let (Some(lo), Some(hi)) = (
            inputs.iter().map(|s| s.min_group()).min(),
            inputs.iter().map(|s| s.max_group()).max(),
        ) else {
            return Ok(None);
        };
        let overlapping: Vec<Arc<ShardMeta>> = version
            .level(output_level)
            .iter()
            .filter(|s| s.overlaps_groups(&lo, &hi))
            .cloned()
            .collect();
        drop(version);

        let bottom = output_level == self.config.deepest_level();
        let retired = self.retired.read().clone();
        let bytes_read: u64 = inputs.iter().chain(&overlapping).map(|s| s.size).sum();

        debug!(
            repo = %self.repo,
            level,
            inputs = inputs.len(),
            overlapping = overlapping.len(),
            "compacting level"
        );

        let sources: Vec<EntrySource<'static>> = inputs
            .iter()
            .chain(&overlapping)
            .map(|meta| Box::new(ShardIter::new(self.store.clone(), meta.clone())) as EntrySource<'static>)
            .collect();

        let mut output = OutputBuilder::new(self, output_level);
        let entries_dropped = match self.merge_into(MergeIter::new(sources), bottom, &retired, &mut output) {
            Ok(dropped) => dropped,
            Err(e) => {
                warn!(repo = %self.repo, level, error = %e, "compaction failed, keeping input shards");
                output.abandon();
                return Err(e);
            }
        };
        let produced = output.produced;
        let bytes_written: u64 = produced.iter().map(|s| s.size).sum();

        let consumed_ids: HashSet<ShardId> = inputs.iter().chain(&overlapping).map(|s| s.id).collect();
        let published = {
            let mut version = self.version.write();
            if self.is_closed() {
                false
            } else {
                let mut next = (**version).clone();
                next.levels[level].retain(|s| !consumed_ids.contains(&s.id));
                next.levels[output_level].retain(|s| !consumed_ids.contains(&s.id));
                next.levels[output_level].extend(produced.iter().cloned());
                next.levels[output_level].sort_by(|a, b| a.min_key.cmp(&b.min_key));
                *version = Arc::new(next);
                true
            }
        };

        let result = CompactionResult {
            level,
            output_level,
            consumed: consumed_ids.len(),
            produced: produced.len(),
            bytes_read,
            bytes_written,
            entries_dropped,
            discarded: !published,
        };

        if !published {
            warn!(repo = %self.repo, level, "repo closed during compaction, discarding output");
            for meta in &produced {
                self.store.delete_segment(meta.id)?;
            }
            self.counters.discarded_compactions.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(result));
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_compacted.fetch_add(bytes_written, Ordering::Relaxed);
        self.counters.entries_dropped.fetch_add(entries_dropped, Ordering::Relaxed);
        info!(
            repo = %self.repo,
            level,
            consumed = result.consumed,
            produced = result.produced,
            bytes_read,
            bytes_written,
            entries_dropped,
            "compaction finished"
        );

        drop(produced);
        self.retire_shards(inputs.into_iter().chain(overlapping).collect());
        Ok(Some(result))
    }

    /// Stream merged entries group by group into `output`. Returns the
    /// number of entries dropped.
    fn merge_into(
        &self,
        merged: MergeIter<'static>,
        bottom: bool,
        retired: &HashSet<CommitId>,
        output: &mut OutputBuilder<'_>,
    ) -> StorageResult<u64> {
        let mut dropped = 0u64;
        let mut group: Vec<Entry> = Vec::new();

        let mut emit = |group: Vec<Entry>, output: &mut OutputBuilder<'_>| -> StorageResult<()> {
            let before = group.len();
            let kept = compact_group(group, bottom, retired);
            dropped += (before - kept.len()) as u64;
            output.add_group(kept)
        };

        for item in merged {
            let entry = item?;
            let same_group = group
                .first()
                .map_or(true, |first| first.key.path == entry.key.path && first.key.commit == entry.key.commit);
            if !same_group {
                emit(std::mem::take(&mut group), output)?;
            }
            group.push(entry);
        }
        emit(group, output)?;
        output.seal()?;
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use crate::storage::config::StorageConfig;
    use crate::storage::error::StorageError;
    use crate::storage::segment::MemorySegmentStore;

    fn manager(config: StorageConfig) -> (LevelManager, MemorySegmentStore) {
        let store = MemorySegmentStore::new();
        let lm = LevelManager::new("test", config, Arc::new(store.clone())).unwrap();
        (lm, store)
    }

    /// Config where nothing compacts unless asked to.
    fn manual() -> StorageConfig {
        StorageConfig::default()
            .shard_threshold(1000)
            .max_levels(3)
            .retry_backoff_ms(0)
    }

    #[test]
    fn test_compact_group_rules() {
        let c = CommitId::generate();
        let none = HashSet::new();

        // data older than the tombstone goes, newer data stays
        let group = vec![
            Entry::tombstone("/a", c, 5, true),
            Entry::data("/a", c, 0, 3, b"old".to_vec()),
            Entry::data("/a", c, 3, 7, b"new".to_vec()),
        ];
        let kept = compact_group(group.clone(), false, &none);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].is_tombstone());
        assert_eq!(kept[1].seq, 7);

        // at the bottom the tombstone is redundant once newer data exists
        let kept = compact_group(group, true, &none);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].seq, 7);

        // inherited deletions survive the bottom level
        let deletion = vec![Entry::tombstone("/a", c, 5, true)];
        assert_eq!(compact_group(deletion, true, &none).len(), 1);
        let root_deletion = vec![Entry::tombstone("/a", c, 5, false)];
        assert!(compact_group(root_deletion.clone(), true, &none).is_empty());
        assert_eq!(compact_group(root_deletion, false, &none).len(), 1);

        let retired: HashSet<CommitId> = [c].into_iter().collect();
        let group = vec![Entry::data("/a", c, 0, 1, b"x".to_vec())];
        assert!(compact_group(group, false, &retired).is_empty());
    }

    #[test]
    fn test_compaction_moves_level_zero_down() {
        let (lm, store) = manager(manual());
        let c = CommitId::generate();
        for i in 0..5 {
            lm.put_data(&format!("/file{}", i), c, 0, format!("{}", i).into_bytes()).unwrap();
            lm.flush().unwrap();
        }
        assert_eq!(lm.stats().levels[0].shards, 5);

        let results = lm.compact().unwrap();
        assert_eq!(results[0].consumed, 5);
        let stats = lm.stats();
        assert_eq!(stats.levels[0].shards, 0);
        assert_eq!(stats.levels[1].shards, 0);
        assert_eq!(stats.levels[2].shards, 1);
        assert_eq!(stats.levels[2].entries, 5);
        // consumed segments are gone
        assert_eq!(store.len(), 1);

        let lineage = [c];
        for i in 0..5 {
            let content = lm.read_file(&format!("/file{}", i), &lineage).unwrap();
            assert_eq!(content, Some(format!("{}", i).into_bytes()));
        }
    }

    #[test]
    fn test_shard_threshold_bounds_level_zero() {
        let config = StorageConfig::default()
            .memory_threshold(1)
            .shard_threshold(4)
            .retry_backoff_ms(0);
        let (lm, _store) = manager(config);
        let c = CommitId::generate();
        for i in 0..21 {
            lm.put_data(&format!("/f{:02}", i), c, 0, b"x".to_vec()).unwrap();
            assert!(lm.stats().levels[0].shards < 4);
        }
        assert!(lm.stats().compactions >= 5);
    }

    #[test]
    fn test_compaction_splits_outputs_at_target_size() {
        let config = manual().level_zero_size(64).max_levels(2);
        let (lm, _store) = manager(config);
        let c = CommitId::generate();
        for i in 0..20 {
            lm.put_data(&format!("/f{:02}", i), c, 0, vec![b'a'; 32]).unwrap();
        }
        lm.flush().unwrap();
        let results = lm.compact().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].produced > 1);

        // output shards of one level never share a group
        let version = lm.snapshot();
        let level = version.level(1);
        for pair in level.windows(2) {
            assert!(pair[0].max_group() < pair[1].min_group());
        }
    }

    #[test]
    fn test_compaction_drops_deleted_and_aborted_data() {
        let (lm, _store) = manager(manual());
        let kept = CommitId::generate();
        let aborted = CommitId::generate();

        lm.put_data("/gone", kept, 0, b"data".to_vec()).unwrap();
        lm.put_data("/stays", kept, 0, b"data".to_vec()).unwrap();
        lm.put_data("/a", aborted, 0, b"junk".to_vec()).unwrap();
        lm.flush().unwrap();
        lm.put_tombstone("/gone", kept, false).unwrap();
        lm.flush().unwrap();
        lm.discard_commit(aborted);

        let results = lm.compact().unwrap();
        let dropped: u64 = results.iter().map(|r| r.entries_dropped).sum();
        assert_eq!(dropped, 3);
        let stats = lm.stats();
        assert_eq!(stats.levels[2].entries, 1);
        assert_eq!(lm.read_file("/gone", &[kept]).unwrap(), None);
        assert_eq!(lm.read_file("/stays", &[kept]).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn test_failed_compaction_keeps_inputs() {
        let config = manual().max_retries(1);
        let (lm, store) = manager(config);
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"one".to_vec()).unwrap();
        lm.flush().unwrap();
        lm.put_data("/b", c, 0, b"two".to_vec()).unwrap();
        lm.flush().unwrap();

        store.fail_next_writes(2);
        let err = lm.compact().unwrap_err();
        assert!(matches!(err, StorageError::CompactionFailure { .. }));
        assert_eq!(lm.stats().levels[0].shards, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(lm.read_file("/a", &[c]).unwrap(), Some(b"one".to_vec()));

        // a later attempt succeeds with the same inputs
        lm.compact().unwrap();
        assert_eq!(lm.read_file("/b", &[c]).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_compact_after_close() {
        let (lm, _store) = manager(manual());
        lm.close().unwrap();
        assert!(matches!(lm.compact(), Err(StorageError::Closed(_))));
    }

    #[test]
    fn test_snapshot_keeps_obsolete_segments_alive() {
        let (lm, store) = manager(manual());
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"x".to_vec()).unwrap();
        lm.flush().unwrap();

        let reader_view = lm.snapshot();
        lm.compact().unwrap();
        // the old level-0 shard is still referenced by the reader's view
        assert_eq!(store.len(), 2);
        assert_eq!(lm.stats().pending_deletes, 1);

        drop(reader_view);
        lm.collect_garbage();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_flush_during_compaction_keeps_new_shards() {
        let (lm, _store) = manager(manual());
        let c = CommitId::generate();
        for i in 0..10 {
            lm.put_data(&format!("/base{}", i), c, 0, vec![b'b'; 16]).unwrap();
            lm.flush().unwrap();
        }

        thread::scope(|s| {
            let writer = s.spawn(|| {
                for i in 0..40u8 {
                    lm.put_data(&format!("/new{:02}", i), c, 0, vec![i; 16]).unwrap();
                    lm.flush().unwrap();
                }
            });
            for _ in 0..5 {
                lm.compact().unwrap();
            }
            writer.join().unwrap();
        });
        lm.compact().unwrap();

        let stats = lm.stats();
        assert_eq!(stats.levels[0].shards, 0);
        let entries: u64 = stats.levels.iter().map(|l| l.entries).sum();
        assert_eq!(entries, 50);
        for i in 0..10 {
            assert_eq!(lm.read_file(&format!("/base{}", i), &[c]).unwrap(), Some(vec![b'b'; 16]));
        }
        for i in 0..40u8 {
            assert_eq!(lm.read_file(&format!("/new{:02}", i), &[c]).unwrap(), Some(vec![i; 16]));
        }
    }

    #[test]
    fn test_reads_during_compaction() {
        let (lm, store) = manager(manual());
        let c = CommitId::generate();
        for i in 0..20 {
            lm.put_data(&format!("/f{:02}", i), c, 0, format!("content {}", i).into_bytes()).unwrap();
            lm.flush().unwrap();
        }
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut rounds = 0;
                while rounds == 0 || !done.load(Ordering::SeqCst) {
                    for i in 0..20 {
                        let content = lm.read_file(&format!("/f{:02}", i), &[c]).unwrap();
                        assert_eq!(content, Some(format!("content {}", i).into_bytes()));
                    }
                    rounds += 1;
                }
                rounds
            });
            for round in 0..5 {
                lm.put_data(&format!("/extra{}", round), c, 0, b"x".to_vec()).unwrap();
                lm.flush().unwrap();
                lm.compact().unwrap();
            }
            done.store(true, Ordering::SeqCst);
            assert!(reader.join().unwrap() > 0);
        });

        lm.collect_garbage();
        assert_eq!(lm.stats().pending_deletes, 0);
        assert_eq!(store.len(), lm.snapshot().shards().count());
    }
}
