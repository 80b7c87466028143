//! Mount adapter error types.

use std::io;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::fuse::handle::OpenMode;
use crate::pfs::PfsError;
use crate::session::ContiguityError;

/// Result type for mount operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors returned by the mount adapter.
#[derive(Debug, Error)]
pub enum FsError {
    /// Engine error (repo, commit, file or storage).
    #[error(transparent)]
    Pfs(#[from] PfsError),

    #[error("bad file descriptor: {0}")]
    BadDescriptor(u64),

    /// Mount paths look like `<repo>/<commit-or-branch>/<path>`.
    #[error("invalid mount path: {0}")]
    InvalidPath(String),

    /// Seek or positional write away from end-of-file on a handle that only
    /// allows appends.
    #[error("seek to {target} denied on {path}: writes must append at {end}")]
    SeekDenied { path: String, target: u64, end: u64 },

    #[error("seek by {delta} from {base} leaves the file's offset range")]
    InvalidSeek { base: u64, delta: i64 },

    #[error("{operation} not supported on a handle opened for {mode}")]
    WrongMode {
        operation: &'static str,
        mode: OpenMode,
    },

    /// The writes of a closed handle do not form a valid file.
    #[error("invalid write pattern for {path}: {source}")]
    Contiguity {
        path: String,
        #[source]
        source: ContiguityError,
    },
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Pfs(e) => e.kind(),
            FsError::SeekDenied { .. } => ErrorKind::SeekDenied,
            FsError::Contiguity { source, .. } => source.kind(),
            FsError::BadDescriptor(_)
            | FsError::InvalidPath(_)
            | FsError::InvalidSeek { .. }
            | FsError::WrongMode { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// check if this error is a missing repo, commit, branch or file
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Pfs(e) if e.is_not_found())
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match e.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::AlreadyFinished => io::ErrorKind::PermissionDenied,
            ErrorKind::SeekDenied => io::ErrorKind::Unsupported,
            ErrorKind::GapError | ErrorKind::BackwardWriteError => {
                io::ErrorKind::InvalidData
            }
            ErrorKind::ConcurrentWriterConflict => io::ErrorKind::WouldBlock,
            ErrorKind::CompactionFailure | ErrorKind::Io => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: io::Error = FsError::SeekDenied {
            path: "/file".to_string(),
            target: 6,
            end: 3,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<FsError>()).unwrap();
        assert_eq!(inner.kind(), ErrorKind::SeekDenied);

        let err: io::Error = FsError::Contiguity {
            path: "/file".to_string(),
            source: ContiguityError::Gap { covered: 3, offset: 6 },
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err: io::Error = FsError::Pfs(PfsError::RepoNotFound("r".to_string())).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_contiguity_kinds() {
        let err = FsError::Contiguity {
            path: "/f".to_string(),
            source: ContiguityError::BackwardWrite {
                offset: 3,
                len: 3,
                covered: 9,
            },
        };
        assert_eq!(err.kind(), ErrorKind::BackwardWriteError);
        assert!(err.kind().is_contiguity_violation());
        assert!(!err.is_not_found());
    }
}
