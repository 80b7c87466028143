//! Segment persistence.
//!
//! Shards are persisted through a [`SegmentStore`], the seam to whatever
//! durable blob store backs the engine. Segments are content addressed:
//! the ID returned by `write_segment` is the git blob ID of the bytes.
//!
//! Two stores ship with the crate:
//! - [`FsSegmentStore`] keeps each segment as a file in a git-style fan-out
//!   directory, written to a temporary name and renamed into place.
//! - [`MemorySegmentStore`] keeps segments in memory and can be told to
//!   fail writes, which the failure-semantics tests rely on.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::ShardId;

/// Blob persistence consumed by the level manager.
pub trait SegmentStore: Send + Sync {
    /// Durably write a segment and return its content address.
    fn write_segment(&self, bytes: &[u8]) -> StorageResult<ShardId>;

    /// Read `range` of a segment. The range is clamped to the segment's length.
    fn read_segment(&self, id: ShardId, range: Range<u64>) -> StorageResult<Vec<u8>>;

    /// Remove a segment. Removing a missing segment is not an error.
    fn delete_segment(&self, id: ShardId) -> StorageResult<()>;
}

fn clamp(range: Range<u64>, len: u64) -> Range<u64> {
    let start = range.start.min(len);
    let end = range.end.min(len).max(start);
    start..end
}

// ==================== Filesystem store ====================

/// Segment store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsSegmentStore {
    root: PathBuf,
}

impl FsSegmentStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("segments"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    /// Get the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, id: ShardId) -> PathBuf {
        let hex = id.to_string();
        self.root.join("segments").join(&hex[..2]).join(&hex[2..])
    }

    /// Count the segments currently on disk.
    pub fn segment_count(&self) -> StorageResult<usize> {
        let mut count = 0;
        for fanout in fs::read_dir(self.root.join("segments"))? {
            let fanout = fanout?;
            if fanout.file_type()?.is_dir() {
                count += fs::read_dir(fanout.path())?.count();
            }
        }
        Ok(count)
    }
}

impl SegmentStore for FsSegmentStore {
    fn write_segment(&self, bytes: &[u8]) -> StorageResult<ShardId> {
        let id = ShardId::for_content(bytes)?;
        let path = self.segment_path(id);
        if path.exists() {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // write under a temporary name, publish by rename
        let mut tmp = NamedTempFile::new_in(self.root.join("tmp"))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        Ok(id)
    }

    fn read_segment(&self, id: ShardId, range: Range<u64>) -> StorageResult<Vec<u8>> {
        let mut file = match File::open(self.segment_path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::SegmentNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let range = clamp(range, len);

        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn delete_segment(&self, id: ShardId) -> StorageResult<()> {
        match fs::remove_file(self.segment_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ==================== Memory store ====================

/// Segment store held in memory.
///
/// Clone to share; clones see the same segments.
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentStore {
    segments: Arc<RwLock<HashMap<ShardId, Arc<Vec<u8>>>>>,
    failing_writes: Arc<AtomicU32>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of segments held.
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Check whether a segment exists.
    pub fn contains(&self, id: ShardId) -> bool {
        self.segments.read().contains_key(&id)
    }

    /// Overwrite a stored segment in place (for corruption tests).
    pub fn corrupt(&self, id: ShardId, bytes: Vec<u8>) {
        self.segments.write().insert(id, Arc::new(bytes));
    }
}

impl SegmentStore for MemorySegmentStore {
    fn write_segment(&self, bytes: &[u8]) -> StorageResult<ShardId> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::SegmentWrite(
                "injected segment write failure".to_string(),
            ));
        }

        let id = ShardId::for_content(bytes)?;
        self.segments
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(id)
    }

    fn read_segment(&self, id: ShardId, range: Range<u64>) -> StorageResult<Vec<u8>> {
        let segment = self
            .segments
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::SegmentNotFound(id))?;
        let range = clamp(range, segment.len() as u64);
        Ok(segment[range.start as usize..range.end as usize].to_vec())
    }

    fn delete_segment(&self, id: ShardId) -> StorageResult<()> {
        self.segments.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn SegmentStore) {
        let id = store.write_segment(b"0123456789").unwrap();
        assert_eq!(id, ShardId::for_content(b"0123456789").unwrap());

        assert_eq!(store.read_segment(id, 0..u64::MAX).unwrap(), b"0123456789");
        assert_eq!(store.read_segment(id, 3..6).unwrap(), b"345");
        assert_eq!(store.read_segment(id, 8..20).unwrap(), b"89");
        assert!(store.read_segment(id, 20..30).unwrap().is_empty());

        // same content, same address
        assert_eq!(store.write_segment(b"0123456789").unwrap(), id);

        store.delete_segment(id).unwrap();
        assert!(matches!(
            store.read_segment(id, 0..1),
            Err(StorageError::SegmentNotFound(_))
        ));
        // deleting twice is fine
        store.delete_segment(id).unwrap();
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemorySegmentStore::new());
    }

    #[test]
    fn test_fs_store() {
        let dir = TempDir::new().unwrap();
        let store = FsSegmentStore::open(dir.path()).unwrap();
        exercise(&store);
        assert_eq!(store.segment_count().unwrap(), 0);
    }

    #[test]
    fn test_fs_store_layout() {
        let dir = TempDir::new().unwrap();
        let store = FsSegmentStore::open(dir.path()).unwrap();
        let id = store.write_segment(b"hello").unwrap();

        let hex = id.to_string();
        let expected = dir.path().join("segments").join(&hex[..2]).join(&hex[2..]);
        assert!(expected.exists());
        assert_eq!(store.segment_count().unwrap(), 1);
        // nothing left behind under the temporary directory
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let store = MemorySegmentStore::new();
        store.fail_next_writes(2);
        assert!(store.write_segment(b"a").is_err());
        assert!(store.write_segment(b"a").is_err());
        assert!(store.write_segment(b"a").is_ok());
        assert_eq!(store.len(), 1);
    }
}
