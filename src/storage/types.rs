//! core type-safe wrappers for the storage layer.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

use git2::{ObjectType, Oid};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of a commit.
///
/// ULID-backed so that IDs sort by creation time. Commit IDs are part of
/// every shard key, which scopes file entries to the commit that wrote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub(crate) Ulid);

impl CommitId {
    /// the smallest possible commit ID, used as a lower scan bound
    pub const MIN: CommitId = CommitId(Ulid(0));

    /// generate a fresh commit ID
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// parse a CommitId from its string form (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(&s.to_uppercase()).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        let s = self.to_string();
        s[s.len() - 8..].to_string()
    }

    pub(crate) fn to_be_bytes(self) -> [u8; 16] {
        self.0 .0.to_be_bytes()
    }

    pub(crate) fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid(u128::from_be_bytes(bytes)))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

impl FromStr for CommitId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Content address of a shard segment.
///
/// Computed the way git names a blob, so a segment's ID doubles as its
/// integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub(crate) Oid);

impl ShardId {
    /// compute the content address of a serialized segment
    pub fn for_content(bytes: &[u8]) -> Result<Self, git2::Error> {
        Oid::hash_object(ObjectType::Blob, bytes).map(ShardId)
    }

    /// parse a ShardId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(ShardId)
    }

    /// short form of the shard ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// what an entry records about its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    /// deletion marker; sorts before data so it leads its group
    Tombstone = 0,
    /// a byte range of file content
    Data = 1,
}

impl EntryKind {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntryKind::Tombstone),
            1 => Some(EntryKind::Data),
            _ => None,
        }
    }
}

/// The sort key of a shard entry: path, then owning commit, then offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub path: String,
    pub commit: CommitId,
    pub offset: u64,
    pub kind: EntryKind,
}

impl EntryKey {
    pub fn data(path: impl Into<String>, commit: CommitId, offset: u64) -> Self {
        Self {
            path: path.into(),
            commit,
            offset,
            kind: EntryKind::Data,
        }
    }

    pub fn tombstone(path: impl Into<String>, commit: CommitId) -> Self {
        Self {
            path: path.into(),
            commit,
            offset: 0,
            kind: EntryKind::Tombstone,
        }
    }

    /// smallest key whose path is `path`
    pub fn lower_bound(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            commit: CommitId::MIN,
            offset: 0,
            kind: EntryKind::Tombstone,
        }
    }

    /// the (path, commit) group this key belongs to
    pub fn group(&self) -> GroupKey {
        GroupKey {
            path: self.path.clone(),
            commit: self.commit,
        }
    }

    pub fn in_group(&self, group: &GroupKey) -> bool {
        self.path == group.path && self.commit == group.commit
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path
            .cmp(&other.path)
            .then(self.commit.cmp(&other.commit))
            .then(self.offset.cmp(&other.offset))
            .then(self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::Data => write!(f, "{}@{}+{}", self.path, self.commit.short(), self.offset),
            EntryKind::Tombstone => write!(f, "{}@{}!", self.path, self.commit.short()),
        }
    }
}

/// All entries one commit wrote for one path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub path: String,
    pub commit: CommitId,
}

/// The value half of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    /// `inherits` is set when the deleting commit has a parent, i.e. the
    /// marker may hide an ancestor's version and must outlive compaction.
    Tombstone { inherits: bool },
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Data(data) => data.len(),
            Payload::Tombstone { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A key, the write sequence that produced it, and its payload.
///
/// `seq` is assigned by the level manager at write time and is what
/// "most recent write wins" compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: EntryKey,
    pub seq: u64,
    pub payload: Payload,
}

impl Entry {
    pub fn data(path: impl Into<String>, commit: CommitId, offset: u64, seq: u64, data: Vec<u8>) -> Self {
        Self {
            key: EntryKey::data(path, commit, offset),
            seq,
            payload: Payload::Data(data),
        }
    }

    pub fn tombstone(path: impl Into<String>, commit: CommitId, seq: u64, inherits: bool) -> Self {
        Self {
            key: EntryKey::tombstone(path, commit),
            seq,
            payload: Payload::Tombstone { inherits },
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, Payload::Tombstone { .. })
    }

    /// rough in-memory footprint, used for the buffer threshold
    pub fn approx_size(&self) -> u64 {
        Self::overhead(self.key.path.len() as u64) + self.payload.len() as u64
    }

    /// footprint of an entry minus its payload bytes
    pub(crate) fn overhead(path_len: u64) -> u64 {
        // commit, offset, seq, kind
        path_len + 16 + 8 + 8 + 1
    }
}

/// The set of paths a scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRange {
    /// one file
    Exact(String),
    /// every file at or below a directory; `/` covers everything
    Under(String),
}

impl PathRange {
    /// first key a scan of this range needs to look at
    pub fn start_key(&self) -> EntryKey {
        match self {
            PathRange::Exact(p) | PathRange::Under(p) => EntryKey::lower_bound(p.as_str()),
        }
    }

    /// Paths matching this predicate form one contiguous run of the key
    /// space; a scan stops at the first path that fails it.
    pub fn in_scan(&self, path: &str) -> bool {
        match self {
            PathRange::Exact(p) => path == p,
            PathRange::Under(p) => path.starts_with(p.as_str()),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        match self {
            PathRange::Exact(p) => path == p,
            PathRange::Under(p) if p == "/" => true,
            PathRange::Under(p) => {
                path.starts_with(p.as_str())
                    && (path.len() == p.len() || path.as_bytes()[p.len()] == b'/')
            }
        }
    }
}

/// Normalize a file path to its canonical form: a single leading `/`,
/// no empty, `.` or `..` components, no trailing slash.
pub fn normalize_path(path: &str) -> Result<String, InvalidPathError> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(InvalidPathError::ParentComponent(path.to_string())),
            c if c.contains('\0') => return Err(InvalidPathError::NulByte(path.to_string())),
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }
    if out.is_empty() {
        return Err(InvalidPathError::Empty);
    }
    Ok(out)
}

/// Normalize a directory prefix for listing. The root lists everything.
pub fn normalize_prefix(prefix: &str) -> Result<String, InvalidPathError> {
    match normalize_path(prefix) {
        Ok(p) => Ok(p),
        Err(InvalidPathError::Empty) => Ok("/".to_string()),
        Err(e) => Err(e),
    }
}

/// error type for invalid file paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidPathError {
    Empty,
    ParentComponent(String),
    NulByte(String),
}

impl fmt::Display for InvalidPathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "path cannot be empty"),
            Self::ParentComponent(p) => write!(f, "path '{}' contains '..'", p),
            Self::NulByte(p) => write!(f, "path '{}' contains a NUL byte", p),
        }
    }
}

impl std::error::Error for InvalidPathError {}
