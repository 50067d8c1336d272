//! Stacked view
//!
//! One writable layer over an ordered list of sealed layers, presenting a
//! single block device. The read path resolves each sub-range to the topmost
//! layer owning it; the write path delegates to the RW layer, patching
//! unaligned edges with read-modify-write against the stack itself.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::index::{
    compress_raw_index, foreach_segments, merge_indexes, Segment, SegmentIndex, SegmentMapping,
    ALIGNMENT,
};

use super::header::{Header, FLAG_CHECKSUM, FLAG_SEALED};
use super::ro::{check_aligned, RoLayer};
use super::rw::{write_sealed_index, DataStat, RwLayer};
use super::MAX_STACK_LAYERS;

/// Stack a writable layer over sealed layers ordered top → bottom.
///
/// With `check_order`, each layer's parent UUID must name the layer below.
pub fn stack_files(rw: RwLayer, ros: Vec<RoLayer>, check_order: bool) -> Result<LayerStack> {
    if ros.len() > MAX_STACK_LAYERS {
        return Err(StrataError::invalid(format!(
            "too many layers: {} > {}",
            ros.len(),
            MAX_STACK_LAYERS
        )));
    }
    if check_order {
        verify_parent_chain(rw.parent_uuid(), &ros)?;
    }

    let stack = LayerStack { rw, ros };
    stack.rebuild_backing();
    Ok(stack)
}

fn verify_parent_chain(mut parent: Uuid, ros: &[RoLayer]) -> Result<()> {
    for (i, ro) in ros.iter().enumerate() {
        if !parent.is_nil() && !ro.uuid().is_nil() && parent != ro.uuid() {
            return Err(StrataError::invalid(format!(
                "layer order mismatch at {}: parent {} != uuid {}",
                i,
                parent,
                ro.uuid()
            )));
        }
        parent = ro.parent_uuid();
    }
    Ok(())
}

/// A writable block device assembled from one RW and K RO layers
pub struct LayerStack {
    rw: RwLayer,
    /// Sealed layers, index 0 = topmost
    ros: Vec<RoLayer>,
}

impl LayerStack {
    pub fn virtual_size(&self) -> u64 {
        self.rw.virtual_size()
    }

    pub fn rw(&self) -> &RwLayer {
        &self.rw
    }

    pub fn layers(&self) -> &[RoLayer] {
        &self.ros
    }

    pub fn data_stat(&self) -> DataStat {
        self.rw.data_stat()
    }

    /// Merge the sealed layers' indexes and splice the result under the
    /// live write index.
    fn rebuild_backing(&self) {
        let indexes: Vec<&dyn SegmentIndex> = self
            .ros
            .iter()
            .map(|ro| ro.index() as &dyn SegmentIndex)
            .collect();
        let end = self.rw.virtual_size() / ALIGNMENT;
        let backing = merge_indexes(&indexes, 0, end);
        self.rw.index().write().set_backing_index(backing);
    }

    /// Swap the sealed layers under the live writer, e.g. after an offline
    /// merge compacted them into one. Readers see the new batch on their
    /// next lookup.
    pub fn replace_lower_layers(&mut self, ros: Vec<RoLayer>) -> Result<()> {
        if ros.len() > MAX_STACK_LAYERS {
            return Err(StrataError::invalid("too many layers"));
        }
        self.ros = ros;
        self.rebuild_backing();
        Ok(())
    }

    /// Read at byte `offset`; sector-aligned, clipped to the virtual size
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_aligned(offset, buf.len())?;
        let begin_sec = offset / ALIGNMENT;
        let want = (buf.len() as u64) / ALIGNMENT;
        let vend_sec = self.virtual_size() / ALIGNMENT;
        let end_sec = (begin_sec + want).min(vend_sec);
        if begin_sec >= end_sec {
            return Ok(0);
        }

        buf.fill(0);
        let index = self.rw.index().read();
        foreach_segments(
            &*index,
            Segment::new(begin_sec, (end_sec - begin_sec) as u32),
            vend_sec,
            |_| Ok(()),
            |m| {
                if m.zeroed {
                    return Ok(());
                }
                let at = ((m.offset - begin_sec) * ALIGNMENT) as usize;
                let len = (m.length as u64 * ALIGNMENT) as usize;
                let dst = &mut buf[at..at + len];
                match m.tag {
                    0 => self.rw.read_extent(m, dst),
                    t => match self.ros.get(t as usize - 1) {
                        Some(ro) => ro.read_extent(m, dst),
                        None => Err(StrataError::state(format!(
                            "mapping tagged {} but stack holds {} sealed layers",
                            t,
                            self.ros.len()
                        ))),
                    },
                }
            },
        )?;
        Ok(((end_sec - begin_sec) * ALIGNMENT) as usize)
    }

    /// Write at byte `offset`. Unaligned edges are completed to full sectors
    /// by reading the stack, so lower-layer content shows through around the
    /// new bytes.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if offset % ALIGNMENT == 0 && buf.len() as u64 % ALIGNMENT == 0 {
            return self.rw.pwrite(buf, offset);
        }

        let end = offset + buf.len() as u64;
        if end > self.virtual_size() {
            return Err(StrataError::invalid(format!(
                "write [{}, {}) exceeds virtual size {}",
                offset,
                end,
                self.virtual_size()
            )));
        }

        let aligned_begin = offset - offset % ALIGNMENT;
        let aligned_end = end.div_ceil(ALIGNMENT) * ALIGNMENT;
        let mut tmp = vec![0u8; (aligned_end - aligned_begin) as usize];
        self.pread(&mut tmp, aligned_begin)?;

        let head = (offset - aligned_begin) as usize;
        tmp[head..head + buf.len()].copy_from_slice(buf);
        self.rw.pwrite(&tmp, aligned_begin)?;
        Ok(buf.len())
    }

    /// Persist the write index trailer and sync the top layer
    pub fn sync(&self) -> Result<()> {
        self.rw.sync()
    }

    /// Commit the top layer as a fresh sealed file; see `RwLayer::commit`
    pub fn commit(&self, dst: &Path) -> Result<()> {
        self.rw.commit(dst)
    }

    /// Seal the top layer in place, dissolving the stack into its parts
    pub fn close_seal(self) -> Result<(RoLayer, Vec<RoLayer>)> {
        let sealed = self.rw.close_seal()?;
        Ok((sealed, self.ros))
    }
}

// =============================================================================
// Offline Merge
// =============================================================================

/// Merge sealed layers (ordered top → bottom) into a single sealed file at
/// `dst`, dropping shadowed extents.
pub fn merge_files_ro(srcs: &[RoLayer], dst: &Path) -> Result<()> {
    if srcs.is_empty() {
        return Err(StrataError::invalid("nothing to merge"));
    }

    let virtual_size = srcs.iter().map(|s| s.virtual_size()).max().unwrap();
    let indexes: Vec<&dyn SegmentIndex> = srcs
        .iter()
        .map(|s| s.index() as &dyn SegmentIndex)
        .collect();
    let merged = merge_indexes(&indexes, 0, virtual_size / ALIGNMENT);

    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;
    let mut header = Header::new(
        virtual_size,
        Uuid::new_v4(),
        srcs.last().unwrap().parent_uuid(),
        FLAG_SEALED | FLAG_CHECKSUM,
    );

    // Stream each surviving extent from its source layer; the output is a
    // single layer, so tags reset to 0 and adjacent runs may re-coalesce.
    let mut cursor = 0u64;
    let mut committed = Vec::with_capacity(merged.size());
    let mut copybuf = vec![0u8; super::rw::DEFAULT_MAX_IO_SIZE];
    for m in merged.buffer() {
        if m.zeroed {
            committed.push(SegmentMapping::zeroed(m.offset, m.length));
            continue;
        }
        let src = &srcs[m.tag as usize];
        let len = m.length as u64 * ALIGNMENT;
        let mut done = 0u64;
        while done < len {
            let n = ((len - done) as usize).min(copybuf.len());
            src.read_extent_bytes(m, done, &mut copybuf[..n])?;
            out.write_all_at(
                &copybuf[..n],
                header.data_offset + cursor * ALIGNMENT + done,
            )?;
            done += n as u64;
        }
        committed.push(SegmentMapping::new(m.offset, m.length, cursor));
        cursor += m.length as u64;
    }
    compress_raw_index(&mut committed);

    write_sealed_index(&out, &mut header, cursor, &committed)?;
    out.sync_all()?;
    Ok(())
}
