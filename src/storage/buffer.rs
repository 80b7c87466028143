//! In-memory write buffer.
//!
//! Writes land here first, ordered by key. A buffer is owned by its repo's
//! level manager; flushing swaps it for an empty one and turns the old one
//! into a level-0 shard.

use std::collections::BTreeMap;

use crate::storage::types::{CommitId, Entry, EntryKey, PathRange, Payload};

#[derive(Debug, Default)]
pub struct WriteBuffer {
    entries: BTreeMap<EntryKey, (u64, Payload)>,
    bytes: u64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any buffered entry with the same key.
    pub fn insert(&mut self, entry: Entry) {
        let size = entry.approx_size();
        let Entry { key, seq, payload } = entry;
        let key_len = key.path.len() as u64;
        if let Some((_, old)) = self.entries.insert(key, (seq, payload)) {
            self.bytes = self
                .bytes
                .saturating_sub(Entry::overhead(key_len) + old.len() as u64);
        }
        self.bytes += size;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held, compared against the memory threshold.
    pub fn approx_bytes(&self) -> u64 {
        self.bytes
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.iter().map(|(key, (seq, payload))| Entry {
            key: key.clone(),
            seq: *seq,
            payload: payload.clone(),
        })
    }

    /// Copy out the entries a scan of `range` covers.
    pub fn collect_range(&self, range: &PathRange) -> Vec<Entry> {
        self.entries
            .range(range.start_key()..)
            .take_while(|(key, _)| range.in_scan(&key.path))
            .filter(|(key, _)| range.contains(&key.path))
            .map(|(key, (seq, payload))| Entry {
                key: key.clone(),
                seq: *seq,
                payload: payload.clone(),
            })
            .collect()
    }

    /// Drop every entry written by `commit`. Returns how many were dropped.
    pub fn discard_commit(&mut self, commit: CommitId) -> usize {
        let before = self.entries.len();
        let mut freed = 0u64;
        self.entries.retain(|key, (_, payload)| {
            let keep = key.commit != commit;
            if !keep {
                freed += Entry::overhead(key.path.len() as u64) + payload.len() as u64;
            }
            keep
        });
        self.bytes = self.bytes.saturating_sub(freed);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces_same_key() {
        let c = CommitId::generate();
        let mut buf = WriteBuffer::new();
        buf.insert(Entry::data("/a", c, 0, 1, Vec::new()));
        let after_marker = buf.approx_bytes();
        buf.insert(Entry::data("/a", c, 0, 2, b"foo".to_vec()));

        assert_eq!(buf.len(), 1);
        assert_eq!(buf.approx_bytes(), after_marker + 3);
        let entries: Vec<Entry> = buf.iter().collect();
        assert_eq!(entries[0].seq, 2);
        assert_eq!(entries[0].payload, Payload::Data(b"foo".to_vec()));
    }

    #[test]
    fn test_collect_range() {
        let c = CommitId::generate();
        let mut buf = WriteBuffer::new();
        for (i, path) in ["/dir/a", "/dir/b", "/dir0", "/e"].iter().enumerate() {
            buf.insert(Entry::data(*path, c, 0, i as u64, b"x".to_vec()));
        }

        let under = buf.collect_range(&PathRange::Under("/dir".to_string()));
        let paths: Vec<&str> = under.iter().map(|e| e.key.path.as_str()).collect();
        assert_eq!(paths, vec!["/dir/a", "/dir/b"]);

        let exact = buf.collect_range(&PathRange::Exact("/e".to_string()));
        assert_eq!(exact.len(), 1);
        assert_eq!(buf.collect_range(&PathRange::Under("/".to_string())).len(), 4);
    }

    #[test]
    fn test_discard_commit() {
        let keep = CommitId::generate();
        let drop = CommitId::generate();
        let mut buf = WriteBuffer::new();
        buf.insert(Entry::data("/a", keep, 0, 1, b"1".to_vec()));
        buf.insert(Entry::data("/a", drop, 0, 2, b"22".to_vec()));
        buf.insert(Entry::tombstone("/b", drop, 3, true));

        assert_eq!(buf.discard_commit(drop), 2);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.approx_bytes(), Entry::data("/a", keep, 0, 1, b"1".to_vec()).approx_size());
        let left = buf.collect_range(&PathRange::Under("/".to_string()));
        assert!(left.iter().all(|e| e.key.commit == keep));
    }
}
