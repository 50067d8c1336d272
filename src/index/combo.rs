//! Merge / combo view
//!
//! Layered lookup across stacked indexes: the topmost layer owning a
//! sub-range wins, lower layers fill the gaps, and every materialized mapping
//! carries its source layer in `tag`. `foreach_segments` is the read driver
//! shared by layer preads, dumps and commit streaming.

use crate::error::Result;

use super::segment::{Segment, SegmentMapping};
use super::sorted::{compress_raw_index, Index};
use super::write::Index0;
use super::{SegmentIndex, MAX_LENGTH};

// =============================================================================
// K-way Merge
// =============================================================================

/// Materialize a flat top-wins view of `layers` (ordered top → bottom) over
/// `[begin, end)`. Entries are tagged with their source position: 0 = top.
pub fn merge_indexes(layers: &[&dyn SegmentIndex], begin: u64, end: u64) -> Index {
    let mut out = Vec::new();
    merge_into(layers, 0, begin, end, &mut out);
    compress_raw_index(&mut out);
    Index::new_unchecked(out)
}

fn merge_into(
    layers: &[&dyn SegmentIndex],
    level: usize,
    begin: u64,
    end: u64,
    out: &mut Vec<SegmentMapping>,
) {
    if level >= layers.len() || begin >= end {
        return;
    }
    let mut found = Vec::new();
    layers[level].lookup_range(begin, end, &mut found);

    let mut pos = begin;
    for m in found {
        if m.offset > pos {
            merge_into(layers, level + 1, pos, m.offset, out);
        }
        out.push(m.with_tag(level as u8));
        pos = m.end();
    }
    if pos < end {
        merge_into(layers, level + 1, pos, end, out);
    }
}

// =============================================================================
// Combo Index
// =============================================================================

/// A mutable write index spliced over a merged read-only backing index.
///
/// Lookups prefer the write index (tag 0); backing hits come back with their
/// merge tag shifted by one, so tags number the layers of the whole stack
/// top-down. The backing index can be swapped out underneath a live writer to
/// splice in a freshly merged batch of sealed layers.
#[derive(Debug, Default)]
pub struct ComboIndex {
    top: Index0,
    backing: Index,
}

impl ComboIndex {
    pub fn new(top: Index0, backing: Index) -> Self {
        ComboIndex { top, backing }
    }

    /// Write-index insert; see `Index0::insert`
    pub fn insert(&mut self, m: SegmentMapping) {
        self.top.insert(m);
    }

    pub fn top(&self) -> &Index0 {
        &self.top
    }

    pub fn block_count(&self) -> u64 {
        self.top.block_count()
    }

    /// Mappings of the write index only, in offset order
    pub fn dump_top(&self) -> Vec<SegmentMapping> {
        self.top.dump()
    }

    /// The unified mapping list of the whole view over `[0, end)`, compressed
    pub fn dump(&self, end: u64) -> Vec<SegmentMapping> {
        let mut out = Vec::new();
        self.lookup_range(0, end, &mut out);
        compress_raw_index(&mut out);
        out
    }

    pub fn backing_index(&self) -> &Index {
        &self.backing
    }

    /// Splice a new bottom layer under the live write index
    pub fn set_backing_index(&mut self, backing: Index) {
        self.backing = backing;
    }
}

impl SegmentIndex for ComboIndex {
    fn size(&self) -> usize {
        self.top.size() + self.backing.size()
    }

    fn front(&self) -> Option<SegmentMapping> {
        match (self.top.front(), self.backing.front()) {
            (Some(a), Some(b)) => Some(if a.offset <= b.offset { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn back(&self) -> Option<SegmentMapping> {
        match (self.top.back(), self.backing.back()) {
            (Some(a), Some(b)) => Some(if a.end() >= b.end() { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn lookup_range(&self, begin: u64, end: u64, out: &mut Vec<SegmentMapping>) {
        let mut tops = Vec::new();
        self.top.lookup_range(begin, end, &mut tops);

        let mut pos = begin;
        for m in tops {
            if m.offset > pos {
                self.fill_from_backing(pos, m.offset, out);
            }
            out.push(m.with_tag(0));
            pos = m.end();
        }
        if pos < end {
            self.fill_from_backing(pos, end, out);
        }
    }
}

impl ComboIndex {
    fn fill_from_backing(&self, begin: u64, end: u64, out: &mut Vec<SegmentMapping>) {
        let mut found = Vec::new();
        self.backing.lookup_range(begin, end, &mut found);
        for m in found {
            let tag = m.tag + 1;
            out.push(m.with_tag(tag));
        }
    }
}

// =============================================================================
// Read Driver
// =============================================================================

/// Walk `s` clipped to `[0, virtual_end)`, calling `on_mapped` for each
/// covered sub-range and `on_zero` for each hole. Holes wider than a single
/// mapping can express are split at the length cap.
pub fn foreach_segments<Z, M>(
    index: &dyn SegmentIndex,
    s: Segment,
    virtual_end: u64,
    mut on_zero: Z,
    mut on_mapped: M,
) -> Result<()>
where
    Z: FnMut(Segment) -> Result<()>,
    M: FnMut(&SegmentMapping) -> Result<()>,
{
    let begin = s.offset.min(virtual_end);
    let end = s.end().min(virtual_end);
    if begin >= end {
        return Ok(());
    }

    let mut found = Vec::new();
    index.lookup_range(begin, end, &mut found);

    let mut pos = begin;
    for m in found {
        if m.offset > pos {
            emit_zeros(pos, m.offset, &mut on_zero)?;
        }
        on_mapped(&m)?;
        pos = m.end();
    }
    if pos < end {
        emit_zeros(pos, end, &mut on_zero)?;
    }
    Ok(())
}

fn emit_zeros<Z>(mut begin: u64, end: u64, on_zero: &mut Z) -> Result<()>
where
    Z: FnMut(Segment) -> Result<()>,
{
    while begin < end {
        let len = (end - begin).min(MAX_LENGTH as u64) as u32;
        on_zero(Segment::new(begin, len))?;
        begin += len as u64;
    }
    Ok(())
}
