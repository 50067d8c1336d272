//! Write index
//!
//! Mutable sorted mapping set keyed by offset. `insert` is the only mutator:
//! it punches a hole the shape of the new mapping through whatever was there
//! before, so the sorted-non-overlap invariant holds after every call and the
//! newly inserted mapping wins.

use std::collections::BTreeMap;

use super::segment::SegmentMapping;
use super::sorted::{compress_raw_index, Index};
use super::SegmentIndex;

/// Mutable set of mappings supporting punch-and-insert with splitting
#[derive(Debug, Default)]
pub struct Index0 {
    map: BTreeMap<u64, SegmentMapping>,

    /// Running sum of `length` over non-zeroed entries
    block_count: u64,
}

impl Index0 {
    pub fn new() -> Self {
        Index0::default()
    }

    /// Build by inserting `raw` in order; overlaps resolve newest-wins
    pub fn from_raw(raw: &[SegmentMapping]) -> Self {
        let mut idx = Index0::new();
        for m in raw {
            idx.insert(*m);
        }
        idx
    }

    /// Insert `m`, splitting or trimming any overlapped entries.
    ///
    /// Pre-existing mappings survive outside `m`'s range; the overlapped
    /// sub-ranges are removed. Zero-length inserts are ignored.
    pub fn insert(&mut self, m: SegmentMapping) {
        if m.length == 0 {
            return;
        }

        let mut removed: Vec<u64> = Vec::new();
        let mut remainders: Vec<SegmentMapping> = Vec::new();
        let mut uncounted: u64 = 0;

        // A predecessor may overhang into m from the left.
        if let Some((&key, e)) = self.map.range(..m.offset).next_back() {
            if e.end() > m.offset {
                removed.push(key);
                if !e.zeroed {
                    uncounted += m.end().min(e.end()) - m.offset;
                }
                if let Some(left) = e.clipped(e.offset, m.offset) {
                    remainders.push(left);
                }
                if let Some(right) = e.clipped(m.end(), e.end()) {
                    remainders.push(right);
                }
            }
        }

        // Entries starting inside [m.offset, m.end()) are trimmed or dropped.
        for (&key, e) in self.map.range(m.offset..m.end()) {
            removed.push(key);
            if !e.zeroed {
                uncounted += m.end().min(e.end()) - e.offset;
            }
            if let Some(right) = e.clipped(m.end(), e.end()) {
                remainders.push(right);
            }
        }

        for key in removed {
            self.map.remove(&key);
        }
        for r in remainders {
            self.map.insert(r.offset, r);
        }

        self.block_count -= uncounted;
        if !m.zeroed {
            self.block_count += m.length as u64;
        }
        self.map.insert(m.offset, m);
    }

    /// Number of non-zeroed sectors logically present
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All mappings in ascending offset order
    pub fn dump(&self) -> Vec<SegmentMapping> {
        self.map.values().copied().collect()
    }

    /// Flatten into an immutable sorted `Index`, coalescing adjacent runs
    pub fn make_read_only_index(&self) -> Index {
        let mut buf = self.dump();
        compress_raw_index(&mut buf);
        Index::new_unchecked(buf)
    }
}

impl SegmentIndex for Index0 {
    fn size(&self) -> usize {
        self.map.len()
    }

    fn front(&self) -> Option<SegmentMapping> {
        self.map.values().next().copied()
    }

    fn back(&self) -> Option<SegmentMapping> {
        self.map.values().next_back().copied()
    }

    fn lookup_range(&self, begin: u64, end: u64, out: &mut Vec<SegmentMapping>) {
        if let Some((_, e)) = self.map.range(..begin).next_back() {
            if let Some(clipped) = e.clipped(begin, end) {
                out.push(clipped);
            }
        }
        for (_, e) in self.map.range(begin..end) {
            if let Some(clipped) = e.clipped(begin, end) {
                out.push(clipped);
            }
        }
    }
}
