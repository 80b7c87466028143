//! ShardFS - a versioned, content-addressed file store
//!
//! Files are written into open commits, commits are finished to make them
//! immutable, and every commit can be read back either through the engine
//! API or through a POSIX-style file descriptor layer. File data lives in
//! immutable shards kept in a leveled, compacted log per repo.
//!
//! # Example
//!
//! ```no_run
//! use shardfs::pfs::Pfs;
//!
//! let pfs = Pfs::in_memory().unwrap();
//! pfs.create_repo("images").unwrap();
//! let commit = pfs.start_commit("images", Some("master"), None).unwrap();
//! pfs.put_file("images", commit, "/cat.png", b"meow".to_vec()).unwrap();
//! pfs.finish_commit("images", commit).unwrap();
//! ```

pub mod cli;
pub mod error;
pub mod fuse;
pub mod pfs;
pub mod session;
pub mod storage;

pub use error::ErrorKind;
