//! File descriptor layer over the engine.
//!
//! [`Mount`] translates open/read/write/seek/close calls on mount paths of
//! the form `<repo>/<commit-or-branch>/<path>` into engine operations.
//! Opening a path in an open commit for write yields a write handle whose
//! seeks are governed by the [`SeekPolicy`]; everything else yields a read
//! handle with unrestricted seeks.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::fuse::error::{FsError, FsResult};
use crate::fuse::handle::{Handle, HandleTarget, OpenMode, ReadHandle, WriteHandle};
use crate::fuse::policy::SeekPolicy;
use crate::pfs::{CommitState, Pfs};
use crate::session::WriteSession;

/// Split a mount path into repo, commit reference and file path.
pub fn parse_mount_path(path: &str) -> FsResult<(&str, &str, &str)> {
    let mut parts = path.trim_start_matches('/').splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(reference), Some(file))
            if !repo.is_empty() && !reference.is_empty() && !file.trim_matches('/').is_empty() =>
        {
            Ok((repo, reference, file))
        }
        _ => Err(FsError::InvalidPath(path.to_string())),
    }
}

/// Open file table for one engine.
///
/// The table lock is only held to look a descriptor up or to insert or
/// remove one; engine calls run under the handle's own lock.
pub struct Mount {
    pfs: Pfs,
    policy: SeekPolicy,
    handles: RwLock<HashMap<u64, Arc<Mutex<Handle>>>>,
    next_fd: AtomicU64,
}

impl Mount {
    /// Mount with the policy named in the engine's configuration.
    pub fn new(pfs: Pfs) -> Self {
        let policy = SeekPolicy::from_config(pfs.config().seek_policy);
        Self::with_policy(pfs, policy)
    }

    pub fn with_policy(pfs: Pfs, policy: SeekPolicy) -> Self {
        debug!(policy = %policy, "mounting");
        Self {
            pfs,
            policy,
            handles: RwLock::new(HashMap::new()),
            next_fd: AtomicU64::new(3),
        }
    }

    pub fn policy(&self) -> SeekPolicy {
        self.policy
    }

    pub fn pfs(&self) -> &Pfs {
        &self.pfs
    }

    pub fn open_handles(&self) -> usize {
        self.handles.read().len()
    }

    fn lookup(&self, fd: u64) -> FsResult<Arc<Mutex<Handle>>> {
        self.handles
            .read()
            .get(&fd)
            .cloned()
            .ok_or(FsError::BadDescriptor(fd))
    }

    /// Run `f` on the handle behind `fd`.
    fn with_handle<T>(&self, fd: u64, f: impl FnOnce(&mut Handle) -> FsResult<T>) -> FsResult<T> {
        let handle = self.lookup(fd)?;
        let mut handle = handle.lock();
        f(&mut handle)
    }

    // ==================== Open / close ====================

    /// Open a mount path and return a file descriptor.
    ///
    /// A branch resolves to its head at open time. Opening for write needs
    /// an open commit and creates or truncates the file.
    pub fn open(&self, path: &str, mode: OpenMode) -> FsResult<u64> {
        let (repo, reference, file) = parse_mount_path(path)?;
        let commit = self.pfs.resolve_commit(repo, reference)?;

        let handle = match mode {
            OpenMode::Write => {
                let path = self.pfs.begin_write(repo, commit, file)?;
                Handle::Write(WriteHandle {
                    target: HandleTarget {
                        repo: repo.to_string(),
                        commit,
                        path,
                    },
                    position: 0,
                    size: 0,
                    session: WriteSession::new(),
                })
            }
            OpenMode::Read => {
                let info = self.pfs.stat_file(repo, commit, file)?;
                Handle::Read(ReadHandle {
                    target: HandleTarget {
                        repo: repo.to_string(),
                        commit,
                        path: info.path,
                    },
                    position: 0,
                    size: info.size,
                })
            }
        };

        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        debug!(fd, repo, commit = %commit.short(), path = %handle.target().path, mode = %mode, "opened");
        self.handles.write().insert(fd, Arc::new(Mutex::new(handle)));
        Ok(fd)
    }

    /// Close a descriptor.
    ///
    /// For a write handle the recorded writes are validated: a valid file is
    /// marked complete in its commit, an invalid one fails here and is
    /// dropped when the commit finishes.
    pub fn close(&self, fd: u64) -> FsResult<()> {
        let entry = self
            .handles
            .write()
            .remove(&fd)
            .ok_or(FsError::BadDescriptor(fd))?;
        // waits for an operation already running on this descriptor
        let handle = entry.lock();

        let Handle::Write(handle) = &*handle else {
            debug!(fd, "closed read handle");
            return Ok(());
        };
        let HandleTarget { repo, commit, path } = &handle.target;
        match handle.session.validate_on_close() {
            Ok(size) => {
                self.pfs.end_write(repo, *commit, path, true)?;
                debug!(fd, path = %path, size, writes = handle.session.len(), "closed write handle");
                Ok(())
            }
            Err(source) => {
                warn!(fd, repo = %repo, commit = %commit, path = %path, error = %source, "rejecting write pattern");
                self.pfs.end_write(repo, *commit, path, false)?;
                Err(FsError::Contiguity {
                    path: path.clone(),
                    source,
                })
            }
        }
    }

    // ==================== Reads ====================

    /// Read into `buf` at the handle's position and advance it. Returns 0 at
    /// end-of-file.
    pub fn read(&self, fd: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.with_handle(fd, |handle| {
            let h = read_handle(handle)?;
            let data = self.pfs.read_file_range(
                &h.target.repo,
                h.target.commit,
                &h.target.path,
                h.position,
                buf.len(),
            )?;
            buf[..data.len()].copy_from_slice(&data);
            h.position = h.position.saturating_add(data.len() as u64);
            Ok(data.len())
        })
    }

    /// Read up to `len` bytes at `offset` without moving the position.
    pub fn read_at(&self, fd: u64, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.with_handle(fd, |handle| {
            let h = read_handle(handle)?;
            Ok(self
                .pfs
                .read_file_range(&h.target.repo, h.target.commit, &h.target.path, offset, len)?)
        })
    }

    // ==================== Writes ====================

    /// Write `data` at the handle's position and advance it.
    pub fn write(&self, fd: u64, data: &[u8]) -> FsResult<usize> {
        self.with_handle(fd, |handle| {
            let h = write_handle(handle, "write")?;
            let offset = h.position;
            self.write_through(h, offset, data)?;
            h.position = h.position.saturating_add(data.len() as u64);
            Ok(data.len())
        })
    }

    /// Write `data` at `offset` without moving the position.
    pub fn write_at(&self, fd: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.with_handle(fd, |handle| {
            let h = write_handle(handle, "write")?;
            if !self.policy.allows_seek(offset, h.size) {
                return Err(FsError::SeekDenied {
                    path: h.target.path.clone(),
                    target: offset,
                    end: h.size,
                });
            }
            self.write_through(h, offset, data)?;
            Ok(data.len())
        })
    }

    fn write_through(&self, h: &mut WriteHandle, offset: u64, data: &[u8]) -> FsResult<()> {
        if !data.is_empty() {
            self.pfs.write_chunk(
                &h.target.repo,
                h.target.commit,
                &h.target.path,
                offset,
                data.to_vec(),
            )?;
        }
        h.record(offset, data.len() as u64);
        Ok(())
    }

    // ==================== Seek / sync ====================

    /// Move the handle's position.
    ///
    /// Read handles seek freely. Write handles under
    /// [`SeekPolicy::DenyNonAppend`] may only seek to end-of-file.
    pub fn seek(&self, fd: u64, pos: SeekFrom) -> FsResult<u64> {
        self.with_handle(fd, |handle| {
            let (base, delta) = match pos {
                SeekFrom::Start(p) => (p, 0),
                SeekFrom::End(p) => (handle.size(), p),
                SeekFrom::Current(p) => (handle.position(), p),
            };
            let target = base
                .checked_add_signed(delta)
                .ok_or(FsError::InvalidSeek { base, delta })?;

            match handle {
                Handle::Read(h) => h.position = target,
                Handle::Write(h) => {
                    if !self.policy.allows_seek(target, h.size) {
                        debug!(fd, path = %h.target.path, target, end = h.size, "seek denied");
                        return Err(FsError::SeekDenied {
                            path: h.target.path.clone(),
                            target,
                            end: h.size,
                        });
                    }
                    h.position = target;
                }
            }
            Ok(target)
        })
    }

    /// Push buffered writes of the handle's repo to storage.
    pub fn sync(&self, fd: u64) -> FsResult<()> {
        self.with_handle(fd, |handle| {
            if let Handle::Write(h) = handle {
                self.pfs.flush(&h.target.repo)?;
            }
            Ok(())
        })
    }

    /// Repo, commit and path behind a descriptor.
    pub fn target(&self, fd: u64) -> FsResult<HandleTarget> {
        self.with_handle(fd, |handle| Ok(handle.target().clone()))
    }

    /// Whether the commit behind a descriptor is still open.
    pub fn is_writable(&self, fd: u64) -> FsResult<bool> {
        let target = self.target(fd)?;
        let state = self.pfs.get_commit_state(&target.repo, target.commit)?;
        Ok(state == CommitState::Open)
    }
}

fn read_handle(handle: &mut Handle) -> FsResult<&mut ReadHandle> {
    let mode = handle.mode();
    match handle {
        Handle::Read(h) => Ok(h),
        Handle::Write(_) => Err(FsError::WrongMode {
            operation: "read",
            mode,
        }),
    }
}

fn write_handle<'a>(handle: &'a mut Handle, operation: &'static str) -> FsResult<&'a mut WriteHandle> {
    let mode = handle.mode();
    match handle {
        Handle::Write(h) => Ok(h),
        Handle::Read(_) => Err(FsError::WrongMode { operation, mode }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::pfs::{PfsConfig, SeekPolicyConfig};
    use crate::storage::{CommitId, MemorySegmentStore, StorageConfig};

    fn setup(policy: SeekPolicy) -> (Mount, CommitId) {
        let pfs = Pfs::in_memory().unwrap();
        pfs.create_repo("test").unwrap();
        let commit = pfs.start_commit("test", Some("master"), None).unwrap();
        (Mount::with_policy(pfs, policy), commit)
    }

    fn file_path(commit: CommitId) -> String {
        format!("test/{}/file", commit)
    }

    fn read_all(mount: &Mount, path: &str) -> Vec<u8> {
        let fd = mount.open(path, OpenMode::Read).unwrap();
        let mut buf = vec![0u8; 64];
        let n = mount.read(fd, &mut buf).unwrap();
        mount.close(fd).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_parse_mount_path() {
        assert_eq!(
            parse_mount_path("/repo/master/dir/file").unwrap(),
            ("repo", "master", "dir/file")
        );
        assert!(parse_mount_path("repo/master").is_err());
        assert!(parse_mount_path("repo/master/").is_err());
        assert!(parse_mount_path("//master/file").is_err());
    }

    #[test]
    fn test_contiguous_writes_then_read() {
        for policy in [SeekPolicy::DenyNonAppend, SeekPolicy::Deferred] {
            let (mount, commit) = setup(policy);
            let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
            assert_eq!(mount.write(fd, b"foo").unwrap(), 3);
            assert_eq!(mount.write(fd, b"baz").unwrap(), 3);
            mount.close(fd).unwrap();
            mount.pfs().finish_commit("test", commit).unwrap();

            let fd = mount.open(&file_path(commit), OpenMode::Read).unwrap();
            let mut buf = [0u8; 6];
            assert_eq!(mount.read(fd, &mut buf).unwrap(), 6);
            assert_eq!(&buf, b"foobaz");

            // past the end reads nothing
            assert_eq!(mount.seek(fd, SeekFrom::Start(6)).unwrap(), 6);
            let mut buf = [0u8; 3];
            assert_eq!(mount.read(fd, &mut buf).unwrap(), 0);
            mount.close(fd).unwrap();
        }
    }

    #[test]
    fn test_seek_read_on_finished_commit() {
        for policy in [SeekPolicy::DenyNonAppend, SeekPolicy::Deferred] {
            let (mount, commit) = setup(policy);
            let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
            mount.write(fd, b"foobarbaz").unwrap();
            mount.close(fd).unwrap();
            mount.pfs().finish_commit("test", commit).unwrap();

            let fd = mount.open("test/master/file", OpenMode::Read).unwrap();
            let mut word = [0u8; 3];
            assert_eq!(mount.read(fd, &mut word).unwrap(), 3);
            assert_eq!(&word, b"foo");
            assert_eq!(mount.seek(fd, SeekFrom::Start(6)).unwrap(), 6);
            assert_eq!(mount.read(fd, &mut word).unwrap(), 3);
            assert_eq!(&word, b"baz");
            assert_eq!(mount.seek(fd, SeekFrom::Current(-6)).unwrap(), 3);
            assert_eq!(mount.read_at(fd, 3, 3).unwrap(), b"bar");
            assert!(!mount.is_writable(fd).unwrap());
            mount.close(fd).unwrap();
        }
    }

    #[test]
    fn test_gap_denied_at_seek() {
        let (mount, commit) = setup(SeekPolicy::DenyNonAppend);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"foo").unwrap();
        mount.sync(fd).unwrap();

        let err = mount.seek(fd, SeekFrom::Start(6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeekDenied);
        // seeking to end-of-file is fine
        assert_eq!(mount.seek(fd, SeekFrom::End(0)).unwrap(), 3);
        mount.write(fd, b"baz").unwrap();
        mount.close(fd).unwrap();

        mount.pfs().finish_commit("test", commit).unwrap();
        assert_eq!(read_all(&mount, &file_path(commit)), b"foobaz");
    }

    #[test]
    fn test_gap_fails_at_close() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"foo").unwrap();
        mount.sync(fd).unwrap();
        assert_eq!(mount.seek(fd, SeekFrom::Start(6)).unwrap(), 6);
        mount.sync(fd).unwrap();
        assert_eq!(mount.write(fd, b"baz").unwrap(), 3);

        let err = mount.close(fd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GapError);
        assert_eq!(mount.open_handles(), 0);

        mount.pfs().finish_commit("test", commit).unwrap();
        let err = mount.open(&file_path(commit), OpenMode::Read).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_backward_write() {
        let (mount, commit) = setup(SeekPolicy::DenyNonAppend);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"foofoofoo").unwrap();
        mount.sync(fd).unwrap();
        let err = mount.seek(fd, SeekFrom::Start(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeekDenied);
        let err = mount.write_at(fd, 3, b"bar").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeekDenied);
        mount.close(fd).unwrap();

        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"foofoofoo").unwrap();
        mount.sync(fd).unwrap();
        assert_eq!(mount.seek(fd, SeekFrom::Start(3)).unwrap(), 3);
        assert_eq!(mount.write(fd, b"bar").unwrap(), 3);
        let err = mount.close(fd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackwardWriteError);

        mount.pfs().finish_commit("test", commit).unwrap();
        assert!(mount.pfs().get_file("test", commit, "/file").unwrap_err().is_not_found());
    }

    #[test]
    fn test_backfilled_gap_fails_at_close() {
        let (mount, commit) = setup(SeekPolicy::DenyNonAppend);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        let err = mount.seek(fd, SeekFrom::Start(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeekDenied);
        mount.close(fd).unwrap();

        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        assert_eq!(mount.seek(fd, SeekFrom::Start(3)).unwrap(), 3);
        mount.write(fd, b"bar").unwrap();
        assert_eq!(mount.seek(fd, SeekFrom::Start(0)).unwrap(), 0);
        mount.write(fd, b"foo").unwrap();
        let err = mount.close(fd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GapError);

        mount.pfs().finish_commit("test", commit).unwrap();
        assert!(mount.pfs().get_file("test", commit, "/file").unwrap_err().is_not_found());
    }

    #[test]
    fn test_backward_write_extending_file() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"foofoofoo").unwrap();
        assert_eq!(mount.seek(fd, SeekFrom::Start(3)).unwrap(), 3);
        mount.write(fd, b"barbarbar").unwrap();
        let err = mount.close(fd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackwardWriteError);
        let io_err: std::io::Error = err.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_finish_before_close_drops_file() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let gap = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(gap, b"foo").unwrap();
        mount.sync(gap).unwrap();
        assert_eq!(mount.seek(gap, SeekFrom::Start(6)).unwrap(), 6);
        mount.sync(gap).unwrap();
        mount.write(gap, b"baz").unwrap();

        let clean = mount
            .open(&format!("test/{}/clean", commit), OpenMode::Write)
            .unwrap();
        mount.write(clean, b"whole").unwrap();

        mount.pfs().finish_commit("test", commit).unwrap();
        assert_eq!(
            mount.write(gap, b"more").unwrap_err().kind(),
            ErrorKind::AlreadyFinished
        );

        assert_eq!(mount.close(gap).unwrap_err().kind(), ErrorKind::GapError);
        assert_eq!(mount.close(clean).unwrap_err().kind(), ErrorKind::AlreadyFinished);
        assert_eq!(mount.open_handles(), 0);

        // nothing an unclosed handle wrote made it into the commit
        for name in ["file", "clean"] {
            let path = format!("test/{}/{}", commit, name);
            assert!(mount.open(&path, OpenMode::Read).unwrap_err().is_not_found());
        }
        assert!(mount.pfs().list_files("test", commit, "/").unwrap().is_empty());
    }

    #[test]
    fn test_seek_out_of_range() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        mount.pfs().put_file("test", commit, "/file", b"abc".to_vec()).unwrap();
        let fd = mount.open(&file_path(commit), OpenMode::Read).unwrap();

        let err = mount.seek(fd, SeekFrom::Current(-1)).unwrap_err();
        assert!(matches!(err, FsError::InvalidSeek { base: 0, delta: -1 }));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(mount.seek(fd, SeekFrom::End(i64::MIN)).is_err());

        assert_eq!(mount.seek(fd, SeekFrom::Start(u64::MAX)).unwrap(), u64::MAX);
        assert!(matches!(
            mount.seek(fd, SeekFrom::Current(1)),
            Err(FsError::InvalidSeek { .. })
        ));
        let mut buf = [0u8; 4];
        assert_eq!(mount.read(fd, &mut buf).unwrap(), 0);
        assert_eq!(mount.seek(fd, SeekFrom::End(-1)).unwrap(), 2);
        mount.close(fd).unwrap();
    }

    #[test]
    fn test_slow_sync_does_not_block_other_repos() {
        let store = MemorySegmentStore::new();
        let storage = StorageConfig::default().max_retries(4).retry_backoff_ms(200);
        let pfs = Pfs::with_store(PfsConfig::in_memory().storage(storage), Arc::new(store.clone())).unwrap();
        pfs.create_repo("a").unwrap();
        pfs.create_repo("b").unwrap();
        let a = pfs.start_commit("a", None, None).unwrap();
        let b = pfs.start_commit("b", None, None).unwrap();
        let mount = Mount::with_policy(pfs, SeekPolicy::DenyNonAppend);

        let slow = mount.open(&format!("a/{}/file", a), OpenMode::Write).unwrap();
        mount.write(slow, b"foo").unwrap();
        // 200 + 400 + 600 ms of backoff before the flush lands
        store.fail_next_writes(3);

        thread::scope(|s| {
            let sync = s.spawn(|| mount.sync(slow));
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            let fd = mount.open(&format!("b/{}/file", b), OpenMode::Write).unwrap();
            mount.write(fd, b"bar").unwrap();
            mount.close(fd).unwrap();
            assert!(started.elapsed() < Duration::from_millis(600));
            assert!(!sync.is_finished());

            sync.join().unwrap().unwrap();
        });

        mount.close(slow).unwrap();
        assert_eq!(mount.pfs().get_file("a", a, "/file").unwrap(), b"foo");
        assert_eq!(mount.pfs().get_file("b", b, "/file").unwrap(), b"bar");
        assert!(mount.pfs().storage_stats("a").unwrap().retries >= 3);
    }

    #[test]
    fn test_parallel_writers_in_separate_repos() {
        let storage = StorageConfig::default()
            .memory_threshold(64)
            .shard_threshold(2)
            .level_zero_size(64);
        let pfs = Pfs::open(PfsConfig::in_memory().storage(storage)).unwrap();
        let repos = ["left", "right"];
        for repo in repos {
            pfs.create_repo(repo).unwrap();
        }
        let mount = Mount::with_policy(pfs, SeekPolicy::DenyNonAppend);

        let expected = |repo: &str, file: usize| format!("{}:{}|", repo, file).repeat(8).into_bytes();

        thread::scope(|s| {
            for repo in repos {
                let mount = &mount;
                s.spawn(move || {
                    let commit = mount.pfs().start_commit(repo, Some("master"), None).unwrap();
                    for file in 0..10 {
                        let fd = mount
                            .open(&format!("{}/{}/f{}", repo, commit, file), OpenMode::Write)
                            .unwrap();
                        for chunk in expected(repo, file).chunks(5) {
                            mount.write(fd, chunk).unwrap();
                        }
                        mount.sync(fd).unwrap();
                        mount.close(fd).unwrap();
                    }
                    mount.pfs().finish_commit(repo, commit).unwrap();
                });
            }
        });

        for repo in repos {
            let files = mount.pfs().list_files(repo, mount.pfs().resolve_commit(repo, "master").unwrap(), "/").unwrap();
            assert_eq!(files.len(), 10);
            for file in 0..10 {
                let path = format!("{}/master/f{}", repo, file);
                let fd = mount.open(&path, OpenMode::Read).unwrap();
                let mut buf = vec![0u8; 256];
                let n = mount.read(fd, &mut buf).unwrap();
                assert_eq!(&buf[..n], &expected(repo, file)[..]);
                mount.close(fd).unwrap();
            }
            assert!(mount.pfs().storage_stats(repo).unwrap().compactions > 0);
        }
    }

    #[test]
    fn test_write_at_end_allowed() {
        let (mount, commit) = setup(SeekPolicy::DenyNonAppend);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write_at(fd, 0, b"foo").unwrap();
        mount.write_at(fd, 3, b"bar").unwrap();
        mount.close(fd).unwrap();
        assert_eq!(mount.pfs().get_file("test", commit, "file").unwrap(), b"foobar");
    }

    #[test]
    fn test_rewrite_after_failed_close() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write_at(fd, 4, b"late").unwrap();
        assert!(mount.close(fd).is_err());

        // a fresh handle truncates and can produce a valid file
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        mount.write(fd, b"good").unwrap();
        mount.close(fd).unwrap();
        mount.pfs().finish_commit("test", commit).unwrap();
        assert_eq!(read_all(&mount, &file_path(commit)), b"good");
    }

    #[test]
    fn test_write_to_finished_commit() {
        let (mount, commit) = setup(SeekPolicy::DenyNonAppend);
        mount.pfs().finish_commit("test", commit).unwrap();
        let err = mount.open(&file_path(commit), OpenMode::Write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyFinished);
        let err = mount.open("test/master/file", OpenMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_single_writer_per_path() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        let err = mount.open(&file_path(commit), OpenMode::Write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentWriterConflict);
        let other = mount
            .open(&format!("test/{}/other", commit), OpenMode::Write)
            .unwrap();
        assert!(mount.is_writable(other).unwrap());
        mount.close(other).unwrap();
        mount.close(fd).unwrap();
    }

    #[test]
    fn test_wrong_mode_and_bad_descriptor() {
        let (mount, commit) = setup(SeekPolicy::Deferred);
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(mount.read(fd, &mut buf), Err(FsError::WrongMode { .. })));
        mount.close(fd).unwrap();

        assert!(matches!(mount.write(fd, b"x"), Err(FsError::BadDescriptor(_))));
        assert!(matches!(mount.close(fd), Err(FsError::BadDescriptor(_))));
        assert!(matches!(
            mount.seek(99, SeekFrom::Start(0)),
            Err(FsError::BadDescriptor(99))
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let config = PfsConfig::in_memory().seek_policy(SeekPolicyConfig::Deferred);
        let mount = Mount::new(Pfs::open(config).unwrap());
        assert_eq!(mount.policy(), SeekPolicy::Deferred);
    }

    #[test]
    fn test_writes_survive_compaction() {
        let storage = StorageConfig::default()
            .memory_threshold(64)
            .shard_threshold(2)
            .level_zero_size(64);
        let pfs = Pfs::open(PfsConfig::in_memory().storage(storage)).unwrap();
        pfs.create_repo("test").unwrap();
        let mount = Mount::with_policy(pfs, SeekPolicy::DenyNonAppend);

        let commit = mount.pfs().start_commit("test", Some("master"), None).unwrap();
        let fd = mount.open(&file_path(commit), OpenMode::Write).unwrap();
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![b'a' + (i % 26); 7];
            mount.write(fd, &chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }
        mount.close(fd).unwrap();
        mount.pfs().finish_commit("test", commit).unwrap();

        assert!(mount.pfs().storage_stats("test").unwrap().compactions > 0);
        let fd = mount.open("test/master/file", OpenMode::Read).unwrap();
        let mut buf = vec![0u8; expected.len() + 10];
        let n = mount.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], &expected[..]);
        mount.close(fd).unwrap();
    }
}
