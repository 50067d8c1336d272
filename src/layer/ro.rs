//! Read-only layer
//!
//! A sealed layer file: header, data log and a persisted index trailer.
//! The index is loaded into a `LevelIndex` on open and never changes.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::index::{foreach_segments, Index, LevelIndex, Segment, SegmentMapping, ALIGNMENT};

use super::header::{decode_record, Header, HEADER_SIZE, RECORD_SIZE};

/// Open a sealed layer file for reading
pub fn open_file_ro(path: &Path) -> Result<RoLayer> {
    let file = File::open(path)?;
    RoLayer::from_file(file)
}

/// An immutable layer of the stack
pub struct RoLayer {
    file: File,
    header: Header,
    index: LevelIndex,
}

impl RoLayer {
    /// Open from an already-opened file handle
    pub fn from_file(file: File) -> Result<Self> {
        let mut head = vec![0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut head, 0)?;
        let header = Header::decode(&head)?;

        if !header.is_sealed() {
            return Err(StrataError::state("layer file is not sealed"));
        }

        let index = load_index(&file, &header)?;
        Ok(RoLayer {
            file,
            header,
            index: LevelIndex::new(index),
        })
    }

    pub(super) fn from_parts(file: File, header: Header, index: LevelIndex) -> Self {
        RoLayer {
            file,
            header,
            index,
        }
    }

    /// Logical size of the block device, in bytes
    pub fn virtual_size(&self) -> u64 {
        self.header.virtual_size
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn parent_uuid(&self) -> Uuid {
        self.header.parent_uuid
    }

    pub fn index(&self) -> &LevelIndex {
        &self.index
    }

    /// Read into `buf` at byte `offset`, clipped to the virtual size.
    ///
    /// Offset and length must be sector-aligned; holes read as zeros.
    /// Returns the number of bytes read.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_aligned(offset, buf.len())?;

        let begin_sec = offset / ALIGNMENT;
        let want = (buf.len() as u64) / ALIGNMENT;
        let vend_sec = self.header.virtual_size / ALIGNMENT;
        let end_sec = (begin_sec + want).min(vend_sec);
        if begin_sec >= end_sec {
            return Ok(0);
        }

        buf.fill(0);
        foreach_segments(
            &self.index,
            Segment::new(begin_sec, (end_sec - begin_sec) as u32),
            vend_sec,
            |_| Ok(()),
            |m| {
                if m.zeroed {
                    return Ok(());
                }
                let at = ((m.offset - begin_sec) * ALIGNMENT) as usize;
                let len = (m.length as u64 * ALIGNMENT) as usize;
                self.read_extent(m, &mut buf[at..at + len])
            },
        )?;
        Ok(((end_sec - begin_sec) * ALIGNMENT) as usize)
    }

    /// Read the physical bytes of one mapping from the data log
    pub(crate) fn read_extent(&self, m: &SegmentMapping, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len() as u64, m.length as u64 * ALIGNMENT);
        self.read_extent_bytes(m, 0, dst)
    }

    /// Read part of one mapping's bytes, starting `at` bytes in
    pub(crate) fn read_extent_bytes(
        &self,
        m: &SegmentMapping,
        at: u64,
        dst: &mut [u8],
    ) -> Result<()> {
        self.file
            .read_exact_at(dst, self.header.data_offset + m.moffset * ALIGNMENT + at)?;
        Ok(())
    }
}

pub(super) fn check_aligned(offset: u64, len: usize) -> Result<()> {
    if offset % ALIGNMENT != 0 || len as u64 % ALIGNMENT != 0 {
        return Err(StrataError::invalid(format!(
            "offset {} / length {} not sector-aligned",
            offset, len
        )));
    }
    Ok(())
}

/// Load and validate the index trailer of a sealed file
fn load_index(file: &File, header: &Header) -> Result<Index> {
    if header.index_offset == 0 {
        return Index::new(Vec::new());
    }
    let nbytes = header
        .index_count
        .checked_mul(RECORD_SIZE as u64)
        .ok_or_else(|| StrataError::corrupt("index count overflow"))?;
    let mut raw = vec![0u8; nbytes as usize];
    file.read_exact_at(&mut raw, header.index_offset)?;

    if header.has_checksum() {
        let crc = crc32fast::hash(&raw);
        if crc != header.index_crc {
            return Err(StrataError::corrupt(format!(
                "index checksum mismatch: {:08x} != {:08x}",
                crc, header.index_crc
            )));
        }
    }

    let mut mappings = Vec::with_capacity(header.index_count as usize);
    for rec in raw.chunks_exact(RECORD_SIZE as usize) {
        mappings.push(decode_record(rec)?);
    }
    Index::new(mappings)
}
