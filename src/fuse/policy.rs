//! Seek enforcement for open-for-write handles.

use std::fmt;

use crate::pfs::SeekPolicyConfig;

/// How an open-for-write handle treats seeks away from end-of-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPolicy {
    /// Reject the seek (or positional write) immediately. Needs the kernel
    /// to honor a non-seekable open, which FUSE on Linux and FreeBSD does.
    DenyNonAppend,
    /// Allow it, record every write and validate the pattern on close.
    Deferred,
}

impl SeekPolicy {
    /// The strongest policy the host's FUSE implementation supports.
    pub fn for_platform() -> Self {
        if cfg!(any(target_os = "linux", target_os = "freebsd")) {
            SeekPolicy::DenyNonAppend
        } else {
            SeekPolicy::Deferred
        }
    }

    pub fn from_config(config: SeekPolicyConfig) -> Self {
        match config {
            SeekPolicyConfig::Auto => Self::for_platform(),
            SeekPolicyConfig::DenyNonAppend => SeekPolicy::DenyNonAppend,
            SeekPolicyConfig::Deferred => SeekPolicy::Deferred,
        }
    }

    /// Whether a write handle at `end` may move to `target`.
    pub fn allows_seek(&self, target: u64, end: u64) -> bool {
        match self {
            SeekPolicy::DenyNonAppend => target == end,
            SeekPolicy::Deferred => true,
        }
    }
}

impl fmt::Display for SeekPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekPolicy::DenyNonAppend => write!(f, "deny-non-append"),
            SeekPolicy::Deferred => write!(f, "deferred"),
        }
    }
}
