//! POSIX-style file access to commits.
//!
//! The mount adapter is what a FUSE frontend calls into: it owns the open
//! file table, picks read or write handles from the commit's state, and
//! enforces that files in open commits are written front to back.
//!
//! Two enforcement strategies exist because not every FUSE implementation
//! can mark an open file non-seekable:
//!
//! - [`SeekPolicy::DenyNonAppend`] rejects a seek away from end-of-file
//!   when it happens (Linux, FreeBSD).
//! - [`SeekPolicy::Deferred`] lets seeks through, records every write in
//!   a [`WriteSession`](crate::session::WriteSession) and rejects an
//!   invalid pattern when the handle closes (macOS).

mod error;
mod handle;
mod mount;
mod policy;

pub use error::{FsError, FsResult};
pub use handle::{HandleTarget, OpenMode};
pub use mount::{parse_mount_path, Mount};
pub use policy::SeekPolicy;
