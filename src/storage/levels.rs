//! Level manager: one per repo.
//!
//! Owns the repo's write buffer, its frozen buffers awaiting flush, and the
//! leveled set of live shards. Writes go to the active buffer; a flush swaps
//! the buffer out under its lock and serializes it into a level-0 shard
//! without holding that lock. The live shard set is a copy-on-write
//! [`LevelSet`] behind an `Arc`, so readers and compactions work from a
//! point-in-time snapshot and only publishing takes the write lock.
//!
//! Compaction lives in [`compaction`](super::compaction) and read
//! resolution in [`resolve`](super::resolve); both extend this type.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::storage::buffer::WriteBuffer;
use crate::storage::config::StorageConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::SegmentStore;
use crate::storage::shard::{ShardMeta, ShardWriter};
use crate::storage::types::{CommitId, Entry, ShardId};

// ==================== Level set ====================

/// The live shards of a repo, by level.
///
/// Level 0 holds overlapping shards in flush order. Deeper levels hold
/// shards sorted by their smallest key.
#[derive(Debug, Clone)]
pub struct LevelSet {
    pub(super) levels: Vec<Vec<Arc<ShardMeta>>>,
}

impl LevelSet {
    pub fn new(max_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); max_levels],
        }
    }

    pub fn level(&self, level: usize) -> &[Arc<ShardMeta>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.level(level).iter().map(|s| s.size).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Every live shard, newest level first.
    pub fn shards(&self) -> impl Iterator<Item = &Arc<ShardMeta>> {
        self.levels.iter().flatten()
    }

    pub fn live_ids(&self) -> HashSet<ShardId> {
        self.shards().map(|s| s.id).collect()
    }
}

// ==================== Statistics ====================

#[derive(Debug, Default)]
pub(super) struct EngineCounters {
    pub flushes: AtomicU64,
    pub bytes_flushed: AtomicU64,
    pub compactions: AtomicU64,
    pub bytes_compacted: AtomicU64,
    pub entries_dropped: AtomicU64,
    pub discarded_compactions: AtomicU64,
    pub retries: AtomicU64,
    pub segments_deleted: AtomicU64,
}

/// Shards and bytes held by one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    pub level: usize,
    pub shards: usize,
    pub bytes: u64,
    pub entries: u64,
}

/// Point-in-time view of a level manager.
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub levels: Vec<LevelStats>,
    pub buffered_bytes: u64,
    pub buffered_entries: usize,
    pub frozen_buffers: usize,
    pub flushes: u64,
    pub bytes_flushed: u64,
    pub compactions: u64,
    pub bytes_compacted: u64,
    pub entries_dropped: u64,
    pub discarded_compactions: u64,
    pub retries: u64,
    pub segments_deleted: u64,
    pub pending_deletes: usize,
}

impl StorageStats {
    pub fn shard_count(&self) -> usize {
        self.levels.iter().map(|l| l.shards).sum()
    }
}

/// Outcome of checking every live shard against its content address.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub corrupted: Vec<(ShardId, String)>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.corrupted.is_empty()
    }
}

// ==================== Level manager ====================

pub struct LevelManager {
    pub(super) repo: String,
    pub(super) config: StorageConfig,
    pub(super) store: Arc<dyn SegmentStore>,

    /// Buffer receiving new writes.
    pub(super) active: Mutex<WriteBuffer>,
    /// Buffers swapped out by a flush but not yet published (oldest first).
    pub(super) frozen: RwLock<Vec<Arc<WriteBuffer>>>,
    /// Live shards. Replaced wholesale on publish.
    pub(super) version: RwLock<Arc<LevelSet>>,
    /// Shards no longer live, deleted once no snapshot references them.
    pub(super) obsolete: Mutex<Vec<Arc<ShardMeta>>>,

    /// Write sequence assigned to each entry.
    pub(super) next_seq: AtomicU64,
    /// Sequence stamped into each new shard's header.
    pub(super) next_shard_seq: AtomicU64,

    pub(super) flush_lock: Mutex<()>,
    pub(super) compaction_lock: Mutex<()>,

    /// Aborted commits whose entries are skipped by reads and compaction.
    pub(super) retired: RwLock<HashSet<CommitId>>,
    pub(super) closed: AtomicBool,
    pub(super) counters: EngineCounters,
    pub(super) created_at: DateTime<Utc>,
}

impl LevelManager {
    pub fn new(
        repo: impl Into<String>,
        config: StorageConfig,
        store: Arc<dyn SegmentStore>,
    ) -> StorageResult<Self> {
        config.validate()?;
        let repo = repo.into();
        debug!(repo = %repo, "creating level manager");

        Ok(Self {
            repo,
            version: RwLock::new(Arc::new(LevelSet::new(config.max_levels))),
            config,
            store,
            active: Mutex::new(WriteBuffer::new()),
            frozen: RwLock::new(Vec::new()),
            obsolete: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            next_shard_seq: AtomicU64::new(1),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            retired: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
            counters: EngineCounters::default(),
            created_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed(self.repo.clone()));
        }
        Ok(())
    }

    /// Current live shard set.
    pub fn snapshot(&self) -> Arc<LevelSet> {
        self.version.read().clone()
    }

    // ==================== Writes ====================

    /// Buffer a byte range of `path` written by `commit`.
    ///
    /// Flushes (and compacts) when the buffer crosses the memory threshold.
    pub fn put_data(&self, path: &str, commit: CommitId, offset: u64, data: Vec<u8>) -> StorageResult<()> {
        self.put(|seq| Entry::data(path, commit, offset, seq, data))
    }

    /// Buffer a deletion marker for `path` in `commit`.
    pub fn put_tombstone(&self, path: &str, commit: CommitId, inherits: bool) -> StorageResult<()> {
        self.put(|seq| Entry::tombstone(path, commit, seq, inherits))
    }

    fn put(&self, make: impl FnOnce(u64) -> Entry) -> StorageResult<()> {
        self.ensure_open()?;
        let over_threshold = {
            let mut active = self.active.lock();
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            active.insert(make(seq));
            active.approx_bytes() >= self.config.memory_threshold
        };
        if over_threshold {
            self.flush()?;
            self.maybe_compact()?;
        }
        Ok(())
    }

    /// Forget every entry written by `commit`.
    ///
    /// Buffered entries are dropped now; entries already in frozen buffers
    /// or shards are hidden from reads and dropped by the next compaction
    /// that touches them.
    pub fn discard_commit(&self, commit: CommitId) -> usize {
        self.retired.write().insert(commit);
        let dropped = self.active.lock().discard_commit(commit);
        debug!(repo = %self.repo, commit = %commit, dropped, "discarded buffered entries");
        dropped
    }

    pub(super) fn is_retired(&self, commit: &CommitId) -> bool {
        self.retired.read().contains(commit)
    }

    // ==================== Flush ====================

    /// Flush buffered writes into level 0.
    ///
    /// Buffers that failed to publish on an earlier attempt are published
    /// first, oldest first. Returns the number of shards published.
    pub fn flush(&self) -> StorageResult<usize> {
        let _guard = self.flush_lock.lock();
        self.ensure_open()?;

        // swap under the buffer lock, serialize without it
        {
            let mut active = self.active.lock();
            if !active.is_empty() {
                let buffer = std::mem::take(&mut *active);
                self.frozen.write().push(Arc::new(buffer));
            }
        }

        let pending: Vec<Arc<WriteBuffer>> = self.frozen.read().clone();
        let mut published = 0;
        for buffer in pending {
            if let Some(meta) = self.write_level_zero(&buffer)? {
                let mut version = self.version.write();
                let mut next = (**version).clone();
                next.levels[0].push(meta.clone());
                *version = Arc::new(next);
                published += 1;

                debug!(
                    repo = %self.repo,
                    shard = %meta.id.short(),
                    entries = meta.entry_count,
                    bytes = meta.size,
                    "flushed level-0 shard"
                );
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_flushed.fetch_add(meta.size, Ordering::Relaxed);
            }
            self.frozen.write().retain(|b| !Arc::ptr_eq(b, &buffer));
        }
        Ok(published)
    }

    /// Serialize a frozen buffer. `None` when nothing in it survives.
    fn write_level_zero(&self, buffer: &WriteBuffer) -> StorageResult<Option<Arc<ShardMeta>>> {
        let retired = self.retired.read().clone();
        let seq = self.next_shard_seq.fetch_add(1, Ordering::SeqCst);
        let mut writer = ShardWriter::new(0, seq, self.config.block_size);
        for entry in buffer.iter() {
            if !retired.contains(&entry.key.commit) {
                writer.add(&entry);
            }
        }
        let Some(encoded) = writer.finish() else {
            return Ok(None);
        };
        let meta = self.with_retry("flush", || encoded.persist(self.store.as_ref()))?;
        Ok(Some(meta))
    }

    /// Run `op`, retrying transient storage failures with linear backoff.
    pub(super) fn with_retry<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt <= self.config.max_retries => {
                    warn!(
                        repo = %self.repo,
                        operation,
                        attempt,
                        error = %e,
                        "storage write failed, retrying"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(self.config.retry_delay(attempt));
                }
                Err(e) if e.is_retriable() => {
                    return Err(StorageError::CompactionFailure {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ==================== Segment cleanup ====================

    /// Queue shards that left the live set for deletion.
    pub(super) fn retire_shards(&self, shards: Vec<Arc<ShardMeta>>) {
        self.obsolete.lock().extend(shards);
        self.collect_garbage();
    }

    /// Delete obsolete segments no reader can still reach.
    pub(super) fn collect_garbage(&self) -> usize {
        let live = self.snapshot().live_ids();
        let mut obsolete = self.obsolete.lock();
        let mut deleted = 0;
        obsolete.retain(|meta| {
            // a reader holding a snapshot still holds a clone of the meta
            if Arc::strong_count(meta) > 1 || live.contains(&meta.id) {
                return true;
            }
            match self.store.delete_segment(meta.id) {
                Ok(()) => {
                    deleted += 1;
                    false
                }
                Err(e) => {
                    warn!(repo = %self.repo, shard = %meta.id.short(), error = %e, "failed to delete segment");
                    true
                }
            }
        });
        self.counters
            .segments_deleted
            .fetch_add(deleted as u64, Ordering::Relaxed);
        deleted
    }

    // ==================== Maintenance ====================

    pub fn stats(&self) -> StorageStats {
        let (buffered_bytes, buffered_entries) = {
            let active = self.active.lock();
            (active.approx_bytes(), active.len())
        };
        let frozen_buffers = self.frozen.read().len();
        let version = self.snapshot();
        let levels = (0..version.level_count())
            .map(|level| LevelStats {
                level,
                shards: version.level(level).len(),
                bytes: version.level_bytes(level),
                entries: version.level(level).iter().map(|s| s.entry_count).sum(),
            })
            .collect();

        let c = &self.counters;
        StorageStats {
            levels,
            buffered_bytes,
            buffered_entries,
            frozen_buffers,
            flushes: c.flushes.load(Ordering::Relaxed),
            bytes_flushed: c.bytes_flushed.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            bytes_compacted: c.bytes_compacted.load(Ordering::Relaxed),
            entries_dropped: c.entries_dropped.load(Ordering::Relaxed),
            discarded_compactions: c.discarded_compactions.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            segments_deleted: c.segments_deleted.load(Ordering::Relaxed),
            pending_deletes: self.obsolete.lock().len(),
        }
    }

    /// Re-read every live shard and check it against its content address.
    pub fn verify(&self) -> StorageResult<VerifyReport> {
        self.ensure_open()?;
        let version = self.snapshot();
        let mut report = VerifyReport::default();
        for shard in version.shards() {
            report.checked += 1;
            match ShardMeta::load(self.store.as_ref(), shard.id) {
                Ok(loaded) if loaded.entry_count == shard.entry_count => {}
                Ok(loaded) => report.corrupted.push((
                    shard.id,
                    format!("expected {} entries, found {}", shard.entry_count, loaded.entry_count),
                )),
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => report.corrupted.push((shard.id, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Shut the manager down and delete every segment it owns.
    ///
    /// A compaction already running finishes and then discards its output.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.flush_lock.lock();

        *self.active.lock() = WriteBuffer::new();
        self.frozen.write().clear();
        let version = {
            let mut version = self.version.write();
            std::mem::replace(&mut *version, Arc::new(LevelSet::new(self.config.max_levels)))
        };

        let mut doomed: Vec<ShardId> = version.shards().map(|s| s.id).collect();
        doomed.extend(self.obsolete.lock().drain(..).map(|s| s.id));
        for id in &doomed {
            self.store.delete_segment(*id)?;
        }
        info!(repo = %self.repo, segments = doomed.len(), "closed storage");
        Ok(())
    }
}

impl std::fmt::Debug for LevelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelManager")
            .field("repo", &self.repo)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::MemorySegmentStore;

    fn manager(config: StorageConfig) -> (LevelManager, MemorySegmentStore) {
        let store = MemorySegmentStore::new();
        let lm = LevelManager::new("test", config, Arc::new(store.clone())).unwrap();
        (lm, store)
    }

    #[test]
    fn test_flush_creates_level_zero_shard() {
        let (lm, store) = manager(StorageConfig::default());
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"hello".to_vec()).unwrap();
        assert_eq!(lm.stats().buffered_entries, 1);

        assert_eq!(lm.flush().unwrap(), 1);
        let stats = lm.stats();
        assert_eq!(stats.buffered_entries, 0);
        assert_eq!(stats.levels[0].shards, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(store.len(), 1);

        // nothing buffered, nothing to do
        assert_eq!(lm.flush().unwrap(), 0);
    }

    #[test]
    fn test_memory_threshold_triggers_flush() {
        let config = StorageConfig::default().memory_threshold(100).shard_threshold(1000);
        let (lm, _store) = manager(config);
        let c = CommitId::generate();
        for i in 0..10u64 {
            lm.put_data("/big", c, i * 64, vec![b'x'; 64]).unwrap();
        }
        let stats = lm.stats();
        assert_eq!(stats.flushes, 10);
        assert_eq!(stats.levels[0].shards, 10);
    }

    #[test]
    fn test_flush_retries_transient_failures() {
        let config = StorageConfig::default().retry_backoff_ms(0);
        let (lm, store) = manager(config);
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"x".to_vec()).unwrap();

        store.fail_next_writes(2);
        assert_eq!(lm.flush().unwrap(), 1);
        assert_eq!(lm.stats().retries, 2);
    }

    #[test]
    fn test_flush_failure_keeps_buffer() {
        let config = StorageConfig::default().max_retries(1).retry_backoff_ms(0);
        let (lm, store) = manager(config);
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"x".to_vec()).unwrap();

        store.fail_next_writes(2);
        let err = lm.flush().unwrap_err();
        assert!(matches!(err, StorageError::CompactionFailure { attempts: 2, .. }));
        assert_eq!(lm.stats().frozen_buffers, 1);
        assert!(store.is_empty());

        // the pending buffer is published by the next flush
        assert_eq!(lm.flush().unwrap(), 1);
        assert_eq!(lm.stats().frozen_buffers, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_discarded_commit_is_not_flushed() {
        let (lm, store) = manager(StorageConfig::default());
        let aborted = CommitId::generate();
        lm.put_data("/a", aborted, 0, b"x".to_vec()).unwrap();
        assert_eq!(lm.discard_commit(aborted), 1);
        assert_eq!(lm.flush().unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_deletes_segments() {
        let (lm, store) = manager(StorageConfig::default());
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"x".to_vec()).unwrap();
        lm.flush().unwrap();
        assert_eq!(store.len(), 1);

        lm.close().unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            lm.put_data("/a", c, 0, b"y".to_vec()),
            Err(StorageError::Closed(_))
        ));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (lm, store) = manager(StorageConfig::default());
        let c = CommitId::generate();
        lm.put_data("/a", c, 0, b"x".to_vec()).unwrap();
        lm.flush().unwrap();

        let report = lm.verify().unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.is_ok());

        let id = lm.snapshot().level(0)[0].id;
        store.corrupt(id, b"junk".to_vec());
        assert!(!lm.verify().unwrap().is_ok());
    }
}
