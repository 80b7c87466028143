//! K-way merge over sorted entry sources.
//!
//! Every source yields entries in ascending key order. The merge yields each
//! distinct key once, carrying the entry with the highest write sequence, so
//! "most recent write wins" holds no matter which shard or buffer the entries
//! came from. Only one entry per source is held at a time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Entry;

/// A sorted, lazily produced stream of entries.
pub type EntrySource<'a> = Box<dyn Iterator<Item = StorageResult<Entry>> + Send + 'a>;

struct HeapItem {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    // BinaryHeap pops the greatest item: smallest key first, then highest seq
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then(self.entry.seq.cmp(&other.entry.seq))
            .then(other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct MergeIter<'a> {
    sources: Vec<EntrySource<'a>>,
    heap: BinaryHeap<HeapItem>,
    error: Option<StorageError>,
    primed: bool,
}

impl<'a> MergeIter<'a> {
    pub fn new(sources: Vec<EntrySource<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            error: None,
            primed: false,
        }
    }

    fn refill(&mut self, source: usize) {
        if self.error.is_some() {
            return;
        }
        match self.sources[source].next() {
            Some(Ok(entry)) => self.heap.push(HeapItem { entry, source }),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
    }
}

impl Iterator for MergeIter<'_> {
    type Item = StorageResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                self.refill(source);
            }
        }
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }

        let top = self.heap.pop()?;
        self.refill(top.source);

        // drop older versions of the same key
        while let Some(peek) = self.heap.peek() {
            if peek.entry.key != top.entry.key {
                break;
            }
            if let Some(shadowed) = self.heap.pop() {
                self.refill(shadowed.source);
            }
        }

        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        Some(Ok(top.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::CommitId;

    fn source(entries: Vec<Entry>) -> EntrySource<'static> {
        Box::new(entries.into_iter().map(Ok::<Entry, StorageError>))
    }

    #[test]
    fn test_merge_orders_and_dedups() {
        let c = CommitId::generate();
        let older = vec![
            Entry::data("/a", c, 0, 1, b"old-a".to_vec()),
            Entry::data("/c", c, 0, 2, b"c".to_vec()),
        ];
        let newer = vec![
            Entry::data("/a", c, 0, 5, b"new-a".to_vec()),
            Entry::data("/b", c, 0, 6, b"b".to_vec()),
        ];

        let merged: Vec<Entry> = MergeIter::new(vec![source(older), source(newer)])
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].payload, crate::storage::types::Payload::Data(b"new-a".to_vec()));
        assert_eq!(merged[1].key.path, "/b");
        assert_eq!(merged[2].key.path, "/c");
    }

    #[test]
    fn test_merge_highest_seq_wins_regardless_of_source_order() {
        let c = CommitId::generate();
        let a = vec![Entry::tombstone("/x", c, 9, true)];
        let b = vec![Entry::tombstone("/x", c, 3, false)];
        let merged: Vec<Entry> = MergeIter::new(vec![source(b), source(a)])
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].seq, 9);
    }

    #[test]
    fn test_merge_empty_sources() {
        let mut merged = MergeIter::new(vec![source(vec![]), source(vec![])]);
        assert!(merged.next().is_none());
        assert!(MergeIter::new(Vec::new()).next().is_none());
    }

    #[test]
    fn test_merge_surfaces_errors() {
        let c = CommitId::generate();
        let failing: EntrySource<'static> = Box::new(
            vec![Err::<Entry, _>(StorageError::SegmentWrite("boom".to_string()))].into_iter(),
        );
        let ok = source(vec![Entry::data("/a", c, 0, 1, b"a".to_vec())]);
        let mut merged = MergeIter::new(vec![ok, failing]);
        assert!(merged.next().unwrap().is_err());
        assert!(merged.next().is_none());
    }
}
