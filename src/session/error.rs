//! Write pattern violations found when a write handle closes.

use thiserror::Error;

use crate::error::ErrorKind;

/// Result type for write session validation.
pub type ContiguityResult<T> = Result<T, ContiguityError>;

/// The recorded writes of a session do not form one contiguous file
/// starting at offset 0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContiguityError {
    /// No write covered `[covered, offset)`.
    #[error("gap in written data: bytes {covered}..{offset} were never written")]
    Gap { covered: u64, offset: u64 },

    /// A write started behind the end of the previous write.
    #[error("backward write of {len} bytes at offset {offset} (covered up to {covered})")]
    BackwardWrite { offset: u64, len: u64, covered: u64 },
}

impl ContiguityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContiguityError::Gap { .. } => ErrorKind::GapError,
            ContiguityError::BackwardWrite { .. } => ErrorKind::BackwardWriteError,
        }
    }
}
