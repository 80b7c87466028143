//! Shard file format.
//!
//! A shard is an immutable, sorted run of entries persisted as one segment.
//!
//! Layout:
//! ```text
//!   [Header]           magic(4) version(4) level(4) seq(8)
//!   [Block 0] [Block 1] ... [Block N]
//!   [Index]            count(4), then per block: first_key, offset(8), len(4), entries(4)
//!   [Footer]           index_offset(8) index_len(8) entry_count(8) magic(4)
//! ```
//!
//! Entry layout:
//! ```text
//!   [key] [seq: u64] [kind-specific payload]
//!   key  = [path_len: u32] [path] [commit: 16] [offset: u64] [kind: u8]
//!   data = [len: u32] [bytes]      tombstone = [inherits: u8]
//! ```
//!
//! The index is kept in memory alongside the shard's metadata, so a reader
//! can start at the block holding a key and pull one block at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::SegmentStore;
use crate::storage::types::{CommitId, Entry, EntryKey, EntryKind, GroupKey, Payload, ShardId};

const SHARD_MAGIC: &[u8; 4] = b"SHRD";
const SHARD_FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 20;
const FOOTER_SIZE: usize = 28;

/// Location of one data block inside a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHandle {
    pub first_key: EntryKey,
    pub offset: u64,
    pub len: u32,
    pub entries: u32,
}

/// Metadata about a published shard (kept in memory by the level manager).
#[derive(Debug, Clone)]
pub struct ShardMeta {
    pub id: ShardId,
    /// level the shard was written for
    pub level: usize,
    /// write order of the shard within its repo
    pub seq: u64,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: EntryKey,
    pub max_key: EntryKey,
    pub index: Vec<BlockHandle>,
    pub created_at: DateTime<Utc>,
}

impl ShardMeta {
    pub fn min_group(&self) -> GroupKey {
        self.min_key.group()
    }

    pub fn max_group(&self) -> GroupKey {
        self.max_key.group()
    }

    /// Check whether this shard's group range intersects `[lo, hi]`.
    pub fn overlaps_groups(&self, lo: &GroupKey, hi: &GroupKey) -> bool {
        self.max_group() >= *lo && self.min_group() <= *hi
    }

    /// Check whether this shard may hold entries for paths under `prefix`
    /// (or exactly `prefix` when `exact`).
    pub fn may_contain_paths(&self, prefix: &str, exact: bool) -> bool {
        if self.max_key.path.as_str() < prefix {
            return false;
        }
        if exact {
            return self.min_key.path.as_str() <= prefix;
        }
        // every path under the prefix sorts before the prefix's successor
        self.min_key.path.as_str() <= prefix || self.min_key.path.starts_with(prefix)
    }

    /// Load a shard's metadata by reading and verifying the whole segment.
    pub fn load(store: &dyn SegmentStore, id: ShardId) -> StorageResult<ShardMeta> {
        let bytes = store.read_segment(id, 0..u64::MAX)?;
        let actual = ShardId::for_content(&bytes)?;
        if actual != id {
            return Err(StorageError::corrupted(
                id,
                format!("content hashes to {}", actual),
            ));
        }
        decode_meta(id, &bytes)
    }
}

// ── Encoding ───────────────────────────────────────────────────────────────

fn encode_key(buf: &mut Vec<u8>, key: &EntryKey) {
    buf.extend_from_slice(&(key.path.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.path.as_bytes());
    buf.extend_from_slice(&key.commit.to_be_bytes());
    buf.extend_from_slice(&key.offset.to_le_bytes());
    buf.push(key.kind as u8);
}

fn encode_entry(buf: &mut Vec<u8>, entry: &Entry) {
    encode_key(buf, &entry.key);
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    match &entry.payload {
        Payload::Data(data) => {
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(data);
        }
        Payload::Tombstone { inherits } => buf.push(u8::from(*inherits)),
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    shard: ShardId,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8], shard: ShardId) -> Self {
        Self { buf, pos: 0, shard }
    }

    fn take(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(StorageError::corrupted(
                self.shard,
                format!("truncated: wanted {} bytes at {}", n, self.pos),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> StorageResult<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> StorageResult<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn key(&mut self) -> StorageResult<EntryKey> {
        let path_len = self.u32()? as usize;
        let path = std::str::from_utf8(self.take(path_len)?)
            .map_err(|e| StorageError::corrupted(self.shard, format!("path: {}", e)))?
            .to_string();
        let mut commit = [0u8; 16];
        commit.copy_from_slice(self.take(16)?);
        let offset = self.u64()?;
        let kind = self.u8()?;
        let kind = EntryKind::from_u8(kind)
            .ok_or_else(|| StorageError::corrupted(self.shard, format!("entry kind {}", kind)))?;
        Ok(EntryKey {
            path,
            commit: CommitId::from_be_bytes(commit),
            offset,
            kind,
        })
    }

    fn entry(&mut self) -> StorageResult<Entry> {
        let key = self.key()?;
        let seq = self.u64()?;
        let payload = match key.kind {
            EntryKind::Data => {
                let len = self.u32()? as usize;
                Payload::Data(self.take(len)?.to_vec())
            }
            EntryKind::Tombstone => Payload::Tombstone {
                inherits: self.u8()? != 0,
            },
        };
        Ok(Entry { key, seq, payload })
    }
}

fn decode_meta(id: ShardId, bytes: &[u8]) -> StorageResult<ShardMeta> {
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(StorageError::corrupted(id, "shorter than header and footer"));
    }

    let mut header = Decoder::new(&bytes[..HEADER_SIZE], id);
    if header.take(4)? != SHARD_MAGIC {
        return Err(StorageError::corrupted(id, "bad header magic"));
    }
    let version = header.u32()?;
    if version != SHARD_FORMAT_VERSION {
        return Err(StorageError::corrupted(id, format!("unknown version {}", version)));
    }
    let level = header.u32()? as usize;
    let seq = header.u64()?;

    let mut footer = Decoder::new(&bytes[bytes.len() - FOOTER_SIZE..], id);
    let index_offset = footer.u64()? as usize;
    let index_len = footer.u64()? as usize;
    let entry_count = footer.u64()?;
    if footer.take(4)? != SHARD_MAGIC {
        return Err(StorageError::corrupted(id, "bad footer magic"));
    }
    if index_offset + index_len > bytes.len() - FOOTER_SIZE {
        return Err(StorageError::corrupted(id, "index out of bounds"));
    }

    let mut index_dec = Decoder::new(&bytes[index_offset..index_offset + index_len], id);
    let count = index_dec.u32()? as usize;
    let mut index = Vec::with_capacity(count);
    for _ in 0..count {
        let first_key = index_dec.key()?;
        let offset = index_dec.u64()?;
        let len = index_dec.u32()?;
        let entries = index_dec.u32()?;
        index.push(BlockHandle {
            first_key,
            offset,
            len,
            entries,
        });
    }

    let first = index
        .first()
        .ok_or_else(|| StorageError::corrupted(id, "shard has no blocks"))?;
    let min_key = first.first_key.clone();
    let last = index.last().cloned().unwrap_or_else(|| first.clone());
    let max_key = decode_block(id, &last, read_slice(id, bytes, &last)?)?
        .pop()
        .map(|e| e.key)
        .ok_or_else(|| StorageError::corrupted(id, "empty last block"))?;

    Ok(ShardMeta {
        id,
        level,
        seq,
        size: bytes.len() as u64,
        entry_count,
        min_key,
        max_key,
        index,
        created_at: Utc::now(),
    })
}

fn read_slice<'a>(id: ShardId, bytes: &'a [u8], block: &BlockHandle) -> StorageResult<&'a [u8]> {
    let start = block.offset as usize;
    let end = start + block.len as usize;
    bytes
        .get(start..end)
        .ok_or_else(|| StorageError::corrupted(id, "block out of bounds"))
}

fn decode_block(id: ShardId, block: &BlockHandle, bytes: &[u8]) -> StorageResult<Vec<Entry>> {
    let mut dec = Decoder::new(bytes, id);
    let mut entries = Vec::with_capacity(block.entries as usize);
    for _ in 0..block.entries {
        entries.push(dec.entry()?);
    }
    Ok(entries)
}

// ── Writer ─────────────────────────────────────────────────────────────────

/// Builds a shard from entries added in ascending key order.
pub struct ShardWriter {
    buf: Vec<u8>,
    level: usize,
    seq: u64,
    block_size: usize,
    index: Vec<BlockHandle>,
    block_start: usize,
    block_first: Option<EntryKey>,
    block_entries: u32,
    entry_count: u64,
    last_key: Option<EntryKey>,
}

impl ShardWriter {
    pub fn new(level: usize, seq: u64, block_size: usize) -> Self {
        let mut buf = Vec::with_capacity(block_size * 2);
        buf.extend_from_slice(SHARD_MAGIC);
        buf.extend_from_slice(&SHARD_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(level as u32).to_le_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());

        Self {
            buf,
            level,
            seq,
            block_size,
            index: Vec::new(),
            block_start: HEADER_SIZE,
            block_first: None,
            block_entries: 0,
            entry_count: 0,
            last_key: None,
        }
    }

    /// Add an entry. Keys MUST be added in strictly ascending order.
    pub fn add(&mut self, entry: &Entry) {
        debug_assert!(
            self.last_key.as_ref().map_or(true, |last| *last < entry.key),
            "shard entries out of order"
        );

        if self.block_first.is_none() {
            self.block_first = Some(entry.key.clone());
        }
        encode_entry(&mut self.buf, entry);
        self.block_entries += 1;
        self.entry_count += 1;
        self.last_key = Some(entry.key.clone());

        if self.buf.len() - self.block_start >= self.block_size {
            self.finish_block();
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn finish_block(&mut self) {
        if let Some(first_key) = self.block_first.take() {
            self.index.push(BlockHandle {
                first_key,
                offset: self.block_start as u64,
                len: (self.buf.len() - self.block_start) as u32,
                entries: self.block_entries,
            });
        }
        self.block_start = self.buf.len();
        self.block_entries = 0;
    }

    /// Seal the shard. Returns `None` if no entries were added.
    pub fn finish(mut self) -> Option<EncodedShard> {
        self.finish_block();
        let min_key = self.index.first()?.first_key.clone();
        let max_key = self.last_key.take()?;

        let index_offset = self.buf.len() as u64;
        self.buf
            .extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for block in &self.index {
            encode_key(&mut self.buf, &block.first_key);
            self.buf.extend_from_slice(&block.offset.to_le_bytes());
            self.buf.extend_from_slice(&block.len.to_le_bytes());
            self.buf.extend_from_slice(&block.entries.to_le_bytes());
        }
        let index_len = self.buf.len() as u64 - index_offset;

        self.buf.extend_from_slice(&index_offset.to_le_bytes());
        self.buf.extend_from_slice(&index_len.to_le_bytes());
        self.buf.extend_from_slice(&self.entry_count.to_le_bytes());
        self.buf.extend_from_slice(SHARD_MAGIC);

        Some(EncodedShard {
            bytes: self.buf,
            level: self.level,
            seq: self.seq,
            entry_count: self.entry_count,
            min_key,
            max_key,
            index: self.index,
        })
    }
}

/// A sealed shard that has not been published yet.
pub struct EncodedShard {
    bytes: Vec<u8>,
    level: usize,
    seq: u64,
    entry_count: u64,
    min_key: EntryKey,
    max_key: EntryKey,
    index: Vec<BlockHandle>,
}

impl EncodedShard {
    /// Write the shard to the store. Safe to call again after a failure.
    pub fn persist(&self, store: &dyn SegmentStore) -> StorageResult<Arc<ShardMeta>> {
        let id = store.write_segment(&self.bytes)?;
        Ok(Arc::new(ShardMeta {
            id,
            level: self.level,
            seq: self.seq,
            size: self.bytes.len() as u64,
            entry_count: self.entry_count,
            min_key: self.min_key.clone(),
            max_key: self.max_key.clone(),
            index: self.index.clone(),
            created_at: Utc::now(),
        }))
    }
}

// ── Reader ─────────────────────────────────────────────────────────────────

/// Lazy iterator over a shard's entries, one block in memory at a time.
///
/// Restart by constructing a new iterator; the shard itself never changes.
pub struct ShardIter {
    store: Arc<dyn SegmentStore>,
    meta: Arc<ShardMeta>,
    next_block: usize,
    current: std::vec::IntoIter<Entry>,
    start: Option<EntryKey>,
    done: bool,
}

impl ShardIter {
    /// Iterate the whole shard.
    pub fn new(store: Arc<dyn SegmentStore>, meta: Arc<ShardMeta>) -> Self {
        Self {
            store,
            meta,
            next_block: 0,
            current: Vec::new().into_iter(),
            start: None,
            done: false,
        }
    }

    /// Iterate entries with keys `>= start`, skipping blocks that end before it.
    pub fn from_key(store: Arc<dyn SegmentStore>, meta: Arc<ShardMeta>, start: EntryKey) -> Self {
        let next_block = meta
            .index
            .partition_point(|b| b.first_key <= start)
            .saturating_sub(1);
        Self {
            store,
            meta,
            next_block,
            current: Vec::new().into_iter(),
            start: Some(start),
            done: false,
        }
    }

    pub fn meta(&self) -> &Arc<ShardMeta> {
        &self.meta
    }

    fn load_block(&mut self) -> StorageResult<bool> {
        let Some(block) = self.meta.index.get(self.next_block) else {
            return Ok(false);
        };
        let range = block.offset..block.offset + block.len as u64;
        let bytes = self.store.read_segment(self.meta.id, range)?;
        if bytes.len() != block.len as usize {
            return Err(StorageError::corrupted(self.meta.id, "short block read"));
        }
        self.current = decode_block(self.meta.id, block, &bytes)?.into_iter();
        self.next_block += 1;
        Ok(true)
    }
}

impl Iterator for ShardIter {
    type Item = StorageResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(entry) = self.current.next() {
                if let Some(start) = &self.start {
                    if entry.key < *start {
                        continue;
                    }
                    self.start = None;
                }
                return Some(Ok(entry));
            }
            match self.load_block() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
