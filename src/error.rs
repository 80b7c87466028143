//! Crate-wide error classification.
//!
//! Every module has its own error enum; `ErrorKind` is the common vocabulary
//! the mount layer and the shell use to decide how to report a failure.

use std::fmt;

/// Coarse classification of every error the crate can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// repo, commit, branch or path does not exist
    NotFound,
    /// a repo or branch with that name already exists
    AlreadyExists,
    /// malformed name, path, parent or configuration
    InvalidArgument,
    /// write to, or finish of, a commit that is no longer open
    AlreadyFinished,
    /// non-append seek rejected on a seek-disallowed write handle
    SeekDenied,
    /// closed write session left a hole
    GapError,
    /// closed write session rewrote bytes behind the frontier, whether or
    /// not the write also extended the file
    BackwardWriteError,
    /// flush or compaction failed after exhausting retries
    CompactionFailure,
    /// a second writer targeted a path already open for write
    ConcurrentWriterConflict,
    /// underlying storage I/O or corrupt data
    Io,
}

impl ErrorKind {
    /// contiguity violations surfaced at close time
    pub fn is_contiguity_violation(&self) -> bool {
        matches!(self, ErrorKind::GapError | ErrorKind::BackwardWriteError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::AlreadyFinished => "AlreadyFinished",
            ErrorKind::SeekDenied => "SeekDenied",
            ErrorKind::GapError => "GapError",
            ErrorKind::BackwardWriteError => "BackwardWriteError",
            ErrorKind::CompactionFailure => "CompactionFailure",
            ErrorKind::ConcurrentWriterConflict => "ConcurrentWriterConflict",
            ErrorKind::Io => "Io",
        };
        f.write_str(name)
    }
}
