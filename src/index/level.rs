//! Level index
//!
//! A sorted `Index` plus a coarse acceleration table: the LBA space is split
//! into fixed-size buckets and each bucket remembers the first entry touching
//! it, so a lookup seeds its scan from the bucket instead of binary-searching
//! the whole index. Pure performance structure; lookup semantics are identical
//! to `Index`.

use super::segment::SegmentMapping;
use super::sorted::Index;
use super::SegmentIndex;

/// Sectors per acceleration bucket (64 KiB of LBA space)
const BUCKET_SECTORS: u64 = 128;

/// Two-tier view over a sorted `Index`
#[derive(Debug, Clone, Default)]
pub struct LevelIndex {
    index: Index,

    /// `buckets[j]` = position of the first entry with `end > j * BUCKET_SECTORS`
    buckets: Vec<u32>,
}

impl LevelIndex {
    pub fn new(index: Index) -> Self {
        let span = index.back().map(|m| m.end()).unwrap_or(0);
        let nbuckets = (span / BUCKET_SECTORS + 1) as usize;
        let mut buckets = vec![index.size() as u32; nbuckets];

        // One pass: each entry claims every bucket it is the first to reach.
        let mut j = 0usize;
        for (i, m) in index.buffer().iter().enumerate() {
            while j < nbuckets && (j as u64) * BUCKET_SECTORS < m.end() {
                buckets[j] = i as u32;
                j += 1;
            }
        }

        LevelIndex { index, buckets }
    }

    pub fn inner(&self) -> &Index {
        &self.index
    }

    pub fn buffer(&self) -> &[SegmentMapping] {
        self.index.buffer()
    }
}

impl SegmentIndex for LevelIndex {
    fn size(&self) -> usize {
        self.index.size()
    }

    fn front(&self) -> Option<SegmentMapping> {
        self.index.front()
    }

    fn back(&self) -> Option<SegmentMapping> {
        self.index.back()
    }

    fn lookup_range(&self, begin: u64, end: u64, out: &mut Vec<SegmentMapping>) {
        let bucket = (begin / BUCKET_SECTORS) as usize;
        if bucket >= self.buckets.len() {
            return;
        }
        let mappings = self.index.buffer();
        let mut i = self.buckets[bucket] as usize;
        while i < mappings.len() && mappings[i].end() <= begin {
            i += 1;
        }
        while i < mappings.len() && mappings[i].offset < end {
            if let Some(clipped) = mappings[i].clipped(begin, end) {
                out.push(clipped);
            }
            i += 1;
        }
    }
}
