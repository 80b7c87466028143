//! Open file handles.

use std::fmt;

use crate::session::WriteSession;
use crate::storage::CommitId;

/// Requested access when opening a mount path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate the file in an open commit.
    Write,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Read => write!(f, "read"),
            OpenMode::Write => write!(f, "write"),
        }
    }
}

/// The file a handle refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTarget {
    pub repo: String,
    pub commit: CommitId,
    pub path: String,
}

#[derive(Debug)]
pub(crate) struct ReadHandle {
    pub target: HandleTarget,
    pub position: u64,
    /// size at open time
    pub size: u64,
}

#[derive(Debug)]
pub(crate) struct WriteHandle {
    pub target: HandleTarget,
    pub position: u64,
    /// end-of-file as seen through this handle
    pub size: u64,
    pub session: WriteSession,
}

impl WriteHandle {
    /// Account for `len` bytes written at `offset`.
    pub fn record(&mut self, offset: u64, len: u64) {
        self.session.record_write(offset, len);
        self.size = self.size.max(offset.saturating_add(len));
    }
}

#[derive(Debug)]
pub(crate) enum Handle {
    Read(ReadHandle),
    Write(WriteHandle),
}

impl Handle {
    pub fn mode(&self) -> OpenMode {
        match self {
            Handle::Read(_) => OpenMode::Read,
            Handle::Write(_) => OpenMode::Write,
        }
    }

    pub fn target(&self) -> &HandleTarget {
        match self {
            Handle::Read(h) => &h.target,
            Handle::Write(h) => &h.target,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Handle::Read(h) => h.size,
            Handle::Write(h) => h.size,
        }
    }

    pub fn position(&self) -> u64 {
        match self {
            Handle::Read(h) => h.position,
            Handle::Write(h) => h.position,
        }
    }
}
