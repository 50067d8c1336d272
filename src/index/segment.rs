//! Segment algebra
//!
//! `Segment` is a half-open LBA range; `SegmentMapping` adds the physical
//! location of its bytes on the data log. Overlap, split and clip arithmetic
//! lives here so the index structures stay free of offset bookkeeping.

/// A half-open LBA range `[offset, offset + length)`, in sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub length: u32,
}

impl Segment {
    pub fn new(offset: u64, length: u32) -> Self {
        Segment { offset, length }
    }

    /// One past the last sector of the range
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// Whether `o` falls inside the range
    pub fn contains(&self, o: u64) -> bool {
        self.offset <= o && o < self.end()
    }

    /// Intersection with `other`, or `None` when disjoint
    pub fn overlap(&self, other: &Segment) -> Option<Segment> {
        let begin = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        if begin >= end {
            return None;
        }
        Some(Segment::new(begin, (end - begin) as u32))
    }
}

/// A `Segment` plus the physical sector address of its bytes.
///
/// `moffset` addresses the owning layer's data log; it is 0 and meaningless
/// when `zeroed`. `tag` identifies the source layer once a merged view has
/// materialized the mapping (0 = topmost).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMapping {
    pub offset: u64,
    pub length: u32,
    pub moffset: u64,
    pub zeroed: bool,
    pub tag: u8,
}

impl SegmentMapping {
    pub fn new(offset: u64, length: u32, moffset: u64) -> Self {
        SegmentMapping {
            offset,
            length,
            moffset,
            zeroed: false,
            tag: 0,
        }
    }

    /// A mapping whose extent reads as zeros and owns no physical bytes
    pub fn zeroed(offset: u64, length: u32) -> Self {
        SegmentMapping {
            offset,
            length,
            moffset: 0,
            zeroed: true,
            tag: 0,
        }
    }

    pub fn segment(&self) -> Segment {
        Segment::new(self.offset, self.length)
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    pub fn contains(&self, o: u64) -> bool {
        self.offset <= o && o < self.end()
    }

    /// Intersection of the LBA range with `s`
    pub fn overlap(&self, s: &Segment) -> Option<Segment> {
        self.segment().overlap(s)
    }

    /// The portion of this mapping inside `[begin, end)`, with `moffset`
    /// shifted by the clipped head; zeroed extents keep `moffset == 0`.
    pub fn clipped(&self, begin: u64, end: u64) -> Option<SegmentMapping> {
        let lo = self.offset.max(begin);
        let hi = self.end().min(end);
        if lo >= hi {
            return None;
        }
        let delta = lo - self.offset;
        Some(SegmentMapping {
            offset: lo,
            length: (hi - lo) as u32,
            moffset: if self.zeroed { 0 } else { self.moffset + delta },
            zeroed: self.zeroed,
            tag: self.tag,
        })
    }

    /// Same as `clipped` but against a `Segment`
    pub fn clip_to(&self, s: &Segment) -> Option<SegmentMapping> {
        self.clipped(s.offset, s.end())
    }

    /// Retag a mapping (used when a merged view materializes it)
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }
}
